//! Table of live call legs
//!
//! One lock guards the whole table and is only held for map manipulation.
//! Connections may call into the registry while holding their own lock; the
//! registry never locks a connection.

use super::connection::ConnectionRef;
use super::dialog::Dialog;
use crate::domain::shared::result::Result;
use crate::domain::shared::{CallHandle, DomainError};
use parking_lot::Mutex;
use std::collections::HashMap;

pub type CallRegistry = Registry<ConnectionRef>;

struct Entry<T> {
    dialog: Dialog,
    value: T,
}

pub struct Registry<T> {
    calls: Mutex<HashMap<CallHandle, Entry<T>>>,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Register a leg. Fails if the handle is taken or another leg already
    /// owns an identical dialog.
    pub fn insert(&self, handle: CallHandle, dialog: Dialog, value: T) -> Result<()> {
        let mut calls = self.calls.lock();
        if calls.contains_key(&handle) {
            return Err(DomainError::AlreadyExists(format!("call {}", handle)));
        }
        if calls.values().any(|e| e.dialog == dialog) {
            return Err(DomainError::AlreadyExists(format!("dialog {}", dialog)));
        }
        calls.insert(handle, Entry { dialog, value });
        Ok(())
    }

    pub fn remove(&self, handle: &CallHandle) -> Option<T> {
        self.calls.lock().remove(handle).map(|e| e.value)
    }

    /// Re-key a leg after it learned a tag
    pub fn update_dialog(&self, handle: &CallHandle, dialog: Dialog) -> Result<()> {
        let mut calls = self.calls.lock();
        if calls
            .iter()
            .any(|(h, e)| h != handle && e.dialog == dialog)
        {
            return Err(DomainError::AlreadyExists(format!("dialog {}", dialog)));
        }
        match calls.get_mut(handle) {
            Some(entry) => {
                entry.dialog = dialog;
                Ok(())
            }
            None => Err(DomainError::NotFound(format!("call {}", handle))),
        }
    }

    pub fn find(&self, handle: &CallHandle) -> Option<T> {
        self.calls.lock().get(handle).map(|e| e.value.clone())
    }

    /// Coarse lookup for early dialogs whose tags are not known yet
    pub fn find_by_call_id(&self, call_id: &str) -> Option<T> {
        self.calls
            .lock()
            .values()
            .find(|e| e.dialog.call_id == call_id)
            .map(|e| e.value.clone())
    }

    /// Exact lookup; tells apart dialogs sharing a Call-ID
    pub fn find_by_dialog(&self, dialog: &Dialog) -> Option<T> {
        self.calls
            .lock()
            .values()
            .find(|e| e.dialog == *dialog)
            .map(|e| e.value.clone())
    }

    pub fn values(&self) -> Vec<T> {
        self.calls.lock().values().map(|e| e.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
