use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::catalogue::{CompiledCatalogue, ValuationWindow};
use crate::error::CatalogueError;

type Slot = Arc<Mutex<Option<Arc<CompiledCatalogue>>>>;

/// Compiled catalogues keyed by valuation window.
///
/// Concurrent callers asking for the same window block on the one
/// compilation in flight rather than compiling twice. A failed compilation
/// leaves the slot empty, so the next caller tries again.
#[derive(Default)]
pub struct CatalogueCache {
    slots: RwLock<HashMap<ValuationWindow, Slot>>,
}

impl CatalogueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile<F>(
        &self,
        window: ValuationWindow,
        compile: F,
    ) -> Result<Arc<CompiledCatalogue>, CatalogueError>
    where
        F: FnOnce() -> Result<CompiledCatalogue, CatalogueError>,
    {
        let slot = self.slot(window);
        let mut slot = slot.lock().unwrap();

        if let Some(catalogue) = slot.as_ref() {
            return Ok(catalogue.clone());
        }

        let catalogue = Arc::new(compile()?);
        *slot = Some(catalogue.clone());
        Ok(catalogue)
    }

    fn slot(&self, window: ValuationWindow) -> Slot {
        if let Some(slot) = self.slots.read().unwrap().get(&window) {
            return slot.clone();
        }

        self.slots
            .write()
            .unwrap()
            .entry(window)
            .or_default()
            .clone()
    }

    /// Drops every catalogue compiled for a window before `window`.
    pub fn invalidate_before(&self, window: ValuationWindow) {
        self.slots.write().unwrap().retain(|key, _| *key >= window);
    }

    /// Number of windows with a slot, compiled or in flight.
    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
