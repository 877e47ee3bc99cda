use crate::{document::DocumentRecord, error::Result};

/// Something that keeps derived state in sync when a record changes.
pub trait DocumentListener: Send + Sync {
    fn document_saved(&self, doc: &DocumentRecord, created: bool) -> Result<()>;
}

/// Registered [`DocumentListener`]s, notified in registration order.
#[derive(Default)]
pub struct Signals {
    listeners: Vec<Box<dyn DocumentListener>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, listener: Box<dyn DocumentListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Notify every listener. A failing listener is logged and does not stop
    /// the others.
    pub fn document_saved(&self, doc: &DocumentRecord, created: bool) {
        for listener in &self.listeners {
            if let Err(e) = listener.document_saved(doc, created) {
                tracing::warn!(
                    doc_id = doc.id,
                    error = %e,
                    "document listener failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signals")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{document_db::tests::sample_record, error::Error};

    struct Recorder(Arc<Mutex<Vec<(u64, bool)>>>);

    impl DocumentListener for Recorder {
        fn document_saved(
            &self,
            doc: &DocumentRecord,
            created: bool,
        ) -> Result<()> {
            self.0.lock().unwrap().push((doc.id, created));
            Ok(())
        }
    }

    struct Failing;

    impl DocumentListener for Failing {
        fn document_saved(&self, _: &DocumentRecord, _: bool) -> Result<()> {
            Err(Error::Config("listener broke".to_string()))
        }
    }

    #[test]
    fn failing_listener_does_not_stop_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut signals = Signals::new();
        signals.connect(Box::new(Failing));
        signals.connect(Box::new(Recorder(Arc::clone(&seen))));
        assert_eq!(signals.len(), 2);

        let mut doc = sample_record("a");
        doc.id = 3;
        signals.document_saved(&doc, false);

        assert_eq!(*seen.lock().unwrap(), vec![(3, false)]);
    }
}
