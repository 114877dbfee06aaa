pub mod diff;
pub mod member_update;

pub use diff::{
    IndexUpdates, PropertyChange, PropertyMap, active_index_updates, diff_interface, fold_changes,
};
pub use member_update::{MemberUpdate, OperationType, UpdateMode};
