//! The replicated value.
//!
//! The log is agnostic to what it stores; a value only needs to be comparable,
//! serializable, and able to absorb client intents.

use std::collections::BTreeSet;
use std::fmt::Debug;

use error_stack::Report;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ConflictError;
use crate::message::Intent;

/// A value that can be replicated through the log.
///
/// `Default` is the value before any slot is committed.
pub trait Replicated:
    Clone + Eq + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Unit of change carried by client intents.
    type Item: Clone + Eq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn insert(&self, item: &Self::Item) -> Result<Self, Report<ConflictError>>;

    fn delete(&self, item: &Self::Item) -> Result<Self, Report<ConflictError>>;

    /// Apply an intent, producing the successor value.
    fn apply(&self, intent: &Intent<Self::Item>) -> Result<Self, Report<ConflictError>> {
        match intent {
            Intent::Insert(item) => self.insert(item),
            Intent::Delete(item) => self.delete(item),
        }
    }
}

/// An ordered set: inserting a present item or deleting an absent one conflicts.
impl<T> Replicated for BTreeSet<T>
where
    T: Clone + Ord + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Item = T;

    fn insert(&self, item: &T) -> Result<Self, Report<ConflictError>> {
        if self.contains(item) {
            return Err(Report::new(ConflictError).attach(format!("{item:?} is already present")));
        }
        let mut next = self.clone();
        BTreeSet::insert(&mut next, item.clone());
        Ok(next)
    }

    fn delete(&self, item: &T) -> Result<Self, Report<ConflictError>> {
        if !self.contains(item) {
            return Err(Report::new(ConflictError).attach(format!("{item:?} is not present")));
        }
        let mut next = self.clone();
        next.remove(item);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_insert_and_delete() {
        let empty = BTreeSet::<String>::new();
        let one = Replicated::insert(&empty, &"standup".to_owned()).unwrap();
        assert!(one.contains("standup"));
        assert!(empty.is_empty());

        let none = Replicated::delete(&one, &"standup".to_owned()).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn set_conflicts() {
        let one = BTreeSet::from([1u32]);
        assert!(Replicated::insert(&one, &1).is_err());
        assert!(Replicated::delete(&one, &2).is_err());
    }

    #[test]
    fn apply_dispatches_on_intent() {
        let value = BTreeSet::<u32>::new()
            .apply(&Intent::Insert(3))
            .and_then(|v| v.apply(&Intent::Insert(5)))
            .and_then(|v| v.apply(&Intent::Delete(3)))
            .unwrap();
        assert_eq!(value, BTreeSet::from([5]));
    }
}
