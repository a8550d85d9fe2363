//! Operation contexts
//!
//! An [`OperationContext`] describes one logical mutation. Top-level
//! repository calls create one; cascades and nested updates derive
//! sub-contexts from it, which keep the origin, origin operation, time and
//! actor of the root while the item, operation and mask change per node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use uuid::Uuid;

use crate::entity::{DeleteStamp, DeleteState};
use crate::mask::DataGraphMask;

/// Bit flags naming what a mutation does
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKind(u16);

impl OperationKind {
    pub const NONE: Self = Self(0);
    pub const ADD: Self = Self(1);
    pub const UPDATE: Self = Self(1 << 1);
    pub const DELETE: Self = Self(1 << 2);
    pub const RECYCLE: Self = Self(1 << 3);
    pub const MOVE_TO_RECYCLE_BIN: Self = Self(Self::UPDATE.0 | Self::RECYCLE.0);
    pub const RESTORE_SELF_DELETED: Self = Self(1 << 4);
    pub const RESTORE_CASCADE_DELETED: Self = Self(1 << 5);

    const NAMES: [(OperationKind, &'static str); 6] = [
        (Self::ADD, "Add"),
        (Self::UPDATE, "Update"),
        (Self::DELETE, "Delete"),
        (Self::RECYCLE, "Recycle"),
        (Self::RESTORE_SELF_DELETED, "RestoreSelfDeleted"),
        (Self::RESTORE_CASCADE_DELETED, "RestoreCascadeDeleted"),
    ];

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: OperationKind) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OperationKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MOVE_TO_RECYCLE_BIN {
            return f.write_str("MoveToRecycleBin");
        }
        if *self == Self::NONE {
            return f.write_str("None");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Who performs an operation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: Option<String>,
    pub user_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
}

impl Actor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn stamp(&self, on: DateTime<Utc>) -> DeleteStamp {
        DeleteStamp {
            on: Some(on),
            by: self.name.clone(),
            by_user_id: self.user_id,
            by_device_id: self.device_id,
        }
    }
}

/// Type and instance identity of an origin item
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginInfo {
    pub type_id: Uuid,
    pub type_name: String,
    pub instance_id: String,
}

/// The entity whose mutation is the root cause of a cascade
#[derive(Clone, Debug, PartialEq)]
pub struct Origin {
    pub info: OriginInfo,
    /// Delete state of the origin when the context was created
    pub delete_state: Option<DeleteState>,
}

#[derive(Debug)]
struct ContextRoot {
    origin_operation: OperationKind,
    origin: Origin,
    time: DateTime<Utc>,
    actor: Actor,
}

/// One logical mutation of one item
#[derive(Clone, Debug)]
pub struct OperationContext<T> {
    root: Arc<ContextRoot>,
    depth: usize,
    operation: OperationKind,
    item: T,
    update_mask: Option<Arc<DataGraphMask>>,
    nested: bool,
}

impl<T> OperationContext<T> {
    /// Root context; `operation` is also the origin operation
    pub fn new(operation: OperationKind, origin: Origin, item: T, time: DateTime<Utc>, actor: Actor) -> Self {
        Self {
            root: Arc::new(ContextRoot {
                origin_operation: operation,
                origin,
                time,
                actor,
            }),
            depth: 0,
            operation,
            item,
            update_mask: None,
            nested: false,
        }
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn origin_operation(&self) -> OperationKind {
        self.root.origin_operation
    }

    pub fn origin(&self) -> &Origin {
        &self.root.origin
    }

    pub fn origin_info(&self) -> &OriginInfo {
        &self.root.origin.info
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.root.time
    }

    pub fn actor(&self) -> &Actor {
        &self.root.actor
    }

    pub fn item(&self) -> &T {
        &self.item
    }

    pub fn into_item(self) -> T {
        self.item
    }

    pub fn update_mask(&self) -> Option<&DataGraphMask> {
        self.update_mask.as_deref()
    }

    pub fn shared_mask(&self) -> Option<Arc<DataGraphMask>> {
        self.update_mask.clone()
    }

    /// True when the item is created as part of its parent's update
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Number of derivations between this context and the root
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// True when both contexts descend from the same root mutation
    pub fn shares_root_with<U>(&self, other: &OperationContext<U>) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// Shallow copy with a different item
    pub fn with_item<U>(&self, item: U) -> OperationContext<U> {
        OperationContext {
            root: self.root.clone(),
            depth: self.depth + 1,
            operation: self.operation,
            item,
            update_mask: self.update_mask.clone(),
            nested: false,
        }
    }

    pub fn with_operation(mut self, operation: OperationKind) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_mask(mut self, mask: Option<Arc<DataGraphMask>>) -> Self {
        self.update_mask = mask;
        self
    }

    pub fn as_nested(mut self) -> Self {
        self.nested = true;
        self
    }

    /// Derived context for a cascaded or nested operation
    pub fn sub_context<U>(
        &self,
        item: U,
        operation: OperationKind,
        mask: Option<Arc<DataGraphMask>>,
    ) -> OperationContext<U> {
        self.with_item(item).with_operation(operation).with_mask(mask)
    }

    /// Context without an item, passed across type-erased boundaries
    pub fn detached(&self) -> OperationContext<()> {
        OperationContext {
            root: self.root.clone(),
            depth: self.depth,
            operation: self.operation,
            item: (),
            update_mask: None,
            nested: self.nested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin {
            info: OriginInfo {
                type_id: Uuid::new_v4(),
                type_name: "customer".to_string(),
                instance_id: "1".to_string(),
            },
            delete_state: None,
        }
    }

    #[test]
    fn test_move_to_recycle_bin_is_composite() {
        let op = OperationKind::MOVE_TO_RECYCLE_BIN;
        assert!(op.contains(OperationKind::UPDATE));
        assert!(op.contains(OperationKind::RECYCLE));
        assert_ne!(op, OperationKind::UPDATE);
        assert_eq!(OperationKind::UPDATE | OperationKind::RECYCLE, op);
        assert_eq!(format!("{:?}", op), "MoveToRecycleBin");
        assert_eq!(format!("{:?}", OperationKind::ADD | OperationKind::DELETE), "Add|Delete");
    }

    #[test]
    fn test_sub_context_preserves_root() {
        let time = Utc::now();
        let ctx = OperationContext::new(OperationKind::UPDATE, origin(), "parent", time, Actor::named("ops"));
        let sub = ctx.sub_context(42u32, OperationKind::ADD, None);

        assert_eq!(*sub.item(), 42);
        assert_eq!(sub.operation(), OperationKind::ADD);
        assert_eq!(sub.origin_operation(), OperationKind::UPDATE);
        assert_eq!(sub.time(), time);
        assert_eq!(sub.actor().name.as_deref(), Some("ops"));
        assert_eq!(sub.origin_info(), ctx.origin_info());
        assert_eq!(sub.depth(), 1);
        assert!(sub.shares_root_with(&ctx));

        // the parent is untouched
        assert_eq!(*ctx.item(), "parent");
        assert_eq!(ctx.operation(), OperationKind::UPDATE);
    }

    #[test]
    fn test_nested_flag_is_not_inherited() {
        let ctx = OperationContext::new(OperationKind::UPDATE, origin(), 1, Utc::now(), Actor::default());
        let nested = ctx.with_item(2).as_nested();
        assert!(nested.is_nested());
        assert!(!nested.with_item(3).is_nested());
    }

    #[test]
    fn test_actor_stamp() {
        let now = Utc::now();
        let stamp = Actor::named("alice").stamp(now);
        assert_eq!(stamp.on, Some(now));
        assert_eq!(stamp.by.as_deref(), Some("alice"));
        assert!(!stamp.is_empty());
    }
}
