use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who removed a record and when
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteStamp {
    pub on: Option<DateTime<Utc>>,
    pub by: Option<String>,
    pub by_user_id: Option<Uuid>,
    pub by_device_id: Option<Uuid>,
}

impl DeleteStamp {
    pub fn is_empty(&self) -> bool {
        self.on.is_none()
    }
}

/// Soft-delete flag groups carried by entities that opt into soft delete
///
/// The four flags are independent: a record can be self-deleted and
/// cascade-deleted at the same time. `is_deleted` is the aggregate flag the
/// query filter looks at.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteState {
    pub is_deleted: bool,
    pub deleted: DeleteStamp,

    pub is_self_deleted: bool,
    pub self_deleted: DeleteStamp,

    pub is_cascade_deleted: bool,
    pub cascade_deleted: DeleteStamp,
    pub cascade_deleted_by_origin_type_id: Option<Uuid>,
    pub cascade_deleted_by_origin_id: Option<String>,

    pub is_recyclable_deleted: bool,
    pub recyclable_deleted: DeleteStamp,
}

impl DeleteState {
    pub fn any_flag(&self) -> bool {
        self.is_deleted || self.is_self_deleted || self.is_cascade_deleted || self.is_recyclable_deleted
    }

    /// Names of the flag groups that differ between two states
    pub fn changed_fields(&self, other: &DeleteState) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.is_deleted != other.is_deleted {
            changed.push("is_deleted");
        }
        if self.deleted != other.deleted {
            changed.push("deleted");
        }
        if self.is_self_deleted != other.is_self_deleted {
            changed.push("is_self_deleted");
        }
        if self.self_deleted != other.self_deleted {
            changed.push("self_deleted");
        }
        if self.is_cascade_deleted != other.is_cascade_deleted {
            changed.push("is_cascade_deleted");
        }
        if self.cascade_deleted != other.cascade_deleted {
            changed.push("cascade_deleted");
        }
        if self.cascade_deleted_by_origin_type_id != other.cascade_deleted_by_origin_type_id {
            changed.push("cascade_deleted_by_origin_type_id");
        }
        if self.cascade_deleted_by_origin_id != other.cascade_deleted_by_origin_id {
            changed.push("cascade_deleted_by_origin_id");
        }
        if self.is_recyclable_deleted != other.is_recyclable_deleted {
            changed.push("is_recyclable_deleted");
        }
        if self.recyclable_deleted != other.recyclable_deleted {
            changed.push("recyclable_deleted");
        }
        changed
    }
}

/// Creation and modification audit fields
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub created_on: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_by_user_id: Option<Uuid>,
    pub modified_on: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
    pub modified_by_user_id: Option<Uuid>,
}

impl AuditInfo {
    pub fn changed_fields(&self, other: &AuditInfo) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.created_on != other.created_on
            || self.created_by != other.created_by
            || self.created_by_user_id != other.created_by_user_id
        {
            changed.push("created");
        }
        if self.modified_on != other.modified_on
            || self.modified_by != other.modified_by
            || self.modified_by_user_id != other.modified_by_user_id
        {
            changed.push("modified");
        }
        changed
    }
}
