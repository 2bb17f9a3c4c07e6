use super::*;

use crate::completion::FixedHead;
use crate::signing::SealStrength;

/// Assembles a [`Coordinator`] and rebuilds its state from the journal.
pub struct CoordinatorBuilder<S: Store> {
    store: Arc<S>,
    config: KernelConfig,
    clock: Arc<dyn Clock>,
    heads: Arc<dyn HeadSource>,
    signer: Option<Signer>,
    journal: Option<Box<dyn Journal>>,
}

impl<S: Store + 'static> CoordinatorBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            config: KernelConfig::default(),
            clock: Arc::new(SystemClock),
            heads: Arc::new(FixedHead::new()),
            signer: None,
            journal: None,
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn head_source(mut self, heads: Arc<dyn HeadSource>) -> Self {
        self.heads = heads;
        self
    }

    /// Overrides any signing seed in the config.
    pub fn signer(mut self, signer: Signer) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn journal(mut self, journal: Box<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn open(self) -> Result<Coordinator<S>, KernelError> {
        self.config.validate()?;
        let signer = match (self.signer, &self.config.signing_seed_hex) {
            (Some(signer), _) => Some(signer),
            (None, Some(seed)) => Some(Signer::from_seed_hex(seed)?),
            (None, None) => None,
        };
        if self.config.seal_strength == SealStrength::Signed && signer.is_none() {
            return Err(KernelError::Config(ConfigError::Invalid {
                key: "seal_strength".into(),
                value: SealStrength::Signed.as_str().into(),
                reason: "signed strength needs a signing key".into(),
            }));
        }
        let journal = self
            .journal
            .unwrap_or_else(|| Box::new(MemJournal::new()));
        let state = replay(journal.as_ref())?;
        log::info!(
            "coordinator ready: workspace {}, {} work items, {} attempts, journal height {}",
            self.config.workspace_id,
            state.ledger.len(),
            state.attempts.iter().count(),
            journal.next_seq()
        );
        Ok(Coordinator {
            store: self.store,
            clock: self.clock,
            heads: self.heads,
            config: self.config,
            signer,
            inner: RwLock::new(Inner { journal, state }),
        })
    }
}

/// Fold every journal entry into a fresh state.
fn replay(journal: &dyn Journal) -> Result<KernelState, KernelError> {
    let entries = journal.load_from(0)?;
    let mut state = KernelState::default();
    for entry in &entries {
        let record = JournalRecord::decode(entry).map_err(|err| KernelError::Replay {
            seq: entry.seq,
            message: err.to_string(),
        })?;
        state.apply(&record);
    }
    log::debug!("replayed {} journal entries", entries.len());
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_strength_requires_a_key() {
        let config = KernelConfig {
            seal_strength: SealStrength::Signed,
            ..KernelConfig::default()
        };
        let err = CoordinatorBuilder::new(Arc::new(MemStore::new()))
            .config(config.clone())
            .open()
            .err()
            .unwrap();
        assert!(matches!(err, KernelError::Config(ConfigError::Invalid { .. })));

        let coord = CoordinatorBuilder::new(Arc::new(MemStore::new()))
            .config(config)
            .signer(Signer::from_seed([1u8; 32]))
            .open()
            .unwrap();
        assert_eq!(
            coord.public_key_hex(),
            Some(Signer::from_seed([1u8; 32]).public_key_hex())
        );
    }

    #[test]
    fn replay_rebuilds_state_from_shared_journal() {
        let journal = MemJournal::new();
        let coord = CoordinatorBuilder::new(Arc::new(MemStore::new()))
            .journal(Box::new(journal.clone()))
            .open()
            .unwrap();
        coord
            .create_work_item(WorkId::from("W1"), "first", Requirements::default())
            .unwrap();

        let reopened = CoordinatorBuilder::new(Arc::new(MemStore::new()))
            .journal(Box::new(MemJournal::from_entries(&journal.entries().unwrap())))
            .open()
            .unwrap();
        let item = reopened.work_item(&WorkId::from("W1")).unwrap().value.unwrap();
        assert_eq!(item.title, "first");
    }
}
