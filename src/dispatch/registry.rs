//! Result-handler registry.
//!
//! The hub protocol allows exactly one completion per invocation, so a target
//! may have at most one live result-returning handler. Admission is an atomic
//! check-and-set on the target's slot; release clears the slot only if it
//! still belongs to the releasing admission, which makes release idempotent
//! and keeps a late release from evicting a newer registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::lock::lock_ignore_poison;
use crate::{Result, RpcError};

/// Proof of a successful admission for one target.
///
/// Not `Clone`: a slot has exactly one owner.
#[derive(Debug, PartialEq, Eq)]
pub struct Admission {
    target: String,
    ticket: u64,
}

impl Admission {
    /// Target this admission holds the slot for.
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Per-connection registry of result-returning handler slots.
#[derive(Debug, Default)]
pub struct ResultHandlerRegistry {
    // ---
    /// Key: target name, Value: ticket of the admission owning the slot.
    slots: Mutex<HashMap<String, u64>>,
    next_ticket: AtomicU64,
}

impl ResultHandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the result-handler slot for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::HandlerConflict`] if another admission holds the
    /// slot. Registering two result handlers for one target is a caller bug,
    /// not a condition to retry.
    pub fn admit(&self, target: &str) -> Result<Admission> {
        // ---
        let mut slots = lock_ignore_poison(&self.slots);

        if slots.contains_key(target) {
            return Err(RpcError::HandlerConflict(target.to_string()));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        slots.insert(target.to_string(), ticket);

        Ok(Admission {
            target: target.to_string(),
            ticket,
        })
    }

    /// Release the slot held by `admission`.
    ///
    /// Returns `true` if this call cleared the slot, `false` if it was
    /// already released (or now belongs to a newer admission).
    pub fn release(&self, admission: &Admission) -> bool {
        // ---
        let mut slots = lock_ignore_poison(&self.slots);

        match slots.get(&admission.target) {
            Some(ticket) if *ticket == admission.ticket => {
                slots.remove(&admission.target);
                true
            }
            _ => false,
        }
    }

    /// Whether a result handler currently holds the slot for `target`.
    pub fn is_registered(&self, target: &str) -> bool {
        lock_ignore_poison(&self.slots).contains_key(target)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.slots).len()
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
