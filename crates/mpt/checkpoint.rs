use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MptError;

/// Monotonically increasing checkpoint number, shared by every participant.
pub type Checkpoint = u64;

/// A persistent component taking part in the two-phase checkpoint protocol.
///
/// `prepare` flushes the component and records a pending on-disk marker;
/// `commit` atomically promotes it; `abort` discards it. `restore` returns
/// the component to the state captured by the given committed checkpoint,
/// rolling a matching pending marker forward first (`guarantee`).
pub trait CheckpointParticipant {
    fn guarantee(&self, checkpoint: Checkpoint) -> Result<(), MptError>;
    fn prepare(&self, checkpoint: Checkpoint) -> Result<(), MptError>;
    fn commit(&self, checkpoint: Checkpoint) -> Result<(), MptError>;
    fn abort(&self, checkpoint: Checkpoint) -> Result<(), MptError>;
    fn restore(&self, checkpoint: Checkpoint) -> Result<(), MptError>;
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
struct CoordinatorMeta {
    #[serde(rename = "Checkpoint")]
    checkpoint: Checkpoint,
}

const COMMITTED_MARKER: &str = "committed.json";
const PREPARE_MARKER: &str = "prepare.json";

/// Drives checkpoint creation and recovery across a fixed set of
/// participants.
///
/// The coordinator's own marker pair is the decision record: a pending
/// coordinator marker means every participant prepared successfully, so
/// recovery rolls the checkpoint forward; without it, pending participant
/// markers are aborted.
pub struct CheckpointCoordinator {
    dir: PathBuf,
    committed: Mutex<Checkpoint>,
}

impl CheckpointCoordinator {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, MptError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let committed = match read_marker(&dir, COMMITTED_MARKER)? {
            Some(meta) => meta.checkpoint,
            None => 0,
        };
        Ok(CheckpointCoordinator {
            dir,
            committed: Mutex::new(committed),
        })
    }

    pub fn committed(&self) -> Checkpoint {
        *self.committed.lock()
    }

    /// Establishes checkpoint 0 on a freshly created directory.
    pub fn initialize(&self, participants: &[&dyn CheckpointParticipant]) -> Result<(), MptError> {
        if read_marker(&self.dir, COMMITTED_MARKER)?.is_some() {
            return Ok(());
        }
        for participant in participants {
            participant.prepare(0)?;
        }
        for participant in participants {
            participant.commit(0)?;
        }
        write_marker(&self.dir, COMMITTED_MARKER, CoordinatorMeta { checkpoint: 0 })?;
        Ok(())
    }

    /// Creates the next checkpoint across all participants.
    ///
    /// If any prepare fails, the pending checkpoint is aborted everywhere
    /// and the committed checkpoint stays unchanged.
    pub fn create_checkpoint(
        &self,
        participants: &[&dyn CheckpointParticipant],
    ) -> Result<Checkpoint, MptError> {
        let mut committed = self.committed.lock();
        let next = *committed + 1;

        for (position, participant) in participants.iter().enumerate() {
            if let Err(err) = participant.prepare(next) {
                warn!(checkpoint = next, %err, "checkpoint prepare failed, aborting");
                for participant in &participants[..=position] {
                    if let Err(abort_err) = participant.abort(next) {
                        warn!(checkpoint = next, %abort_err, "checkpoint abort failed");
                    }
                }
                return Err(err);
            }
        }

        // decision record: from here on, recovery rolls forward
        write_marker(
            &self.dir,
            PREPARE_MARKER,
            CoordinatorMeta { checkpoint: next },
        )?;

        for participant in participants {
            participant.commit(next)?;
        }

        fs::rename(
            self.dir.join(PREPARE_MARKER),
            self.dir.join(COMMITTED_MARKER),
        )?;
        *committed = next;
        debug!(checkpoint = next, "checkpoint committed");
        Ok(next)
    }

    /// Brings every participant back to the last durable checkpoint and
    /// returns it. Rolls a decided-but-unfinished checkpoint forward and
    /// aborts an undecided one.
    pub fn restore(
        &self,
        participants: &[&dyn CheckpointParticipant],
    ) -> Result<Checkpoint, MptError> {
        let mut committed = self.committed.lock();

        let target = match read_marker(&self.dir, PREPARE_MARKER)? {
            Some(pending) => {
                for participant in participants {
                    participant.guarantee(pending.checkpoint)?;
                }
                fs::rename(
                    self.dir.join(PREPARE_MARKER),
                    self.dir.join(COMMITTED_MARKER),
                )?;
                pending.checkpoint
            }
            None => {
                let meta = read_marker(&self.dir, COMMITTED_MARKER)?.ok_or_else(|| {
                    MptError::corrupt(format!(
                        "no committed checkpoint in {}",
                        self.dir.display()
                    ))
                })?;
                for participant in participants {
                    // drop any undecided pending markers
                    let _ = participant.abort(meta.checkpoint + 1);
                }
                meta.checkpoint
            }
        };

        for participant in participants {
            participant.restore(target)?;
        }
        *committed = target;
        debug!(checkpoint = target, "checkpoint restored");
        Ok(target)
    }
}

fn read_marker(dir: &std::path::Path, name: &str) -> Result<Option<CoordinatorMeta>, MptError> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
}

fn write_marker(
    dir: &std::path::Path,
    name: &str,
    meta: CoordinatorMeta,
) -> Result<(), MptError> {
    fs::write(dir.join(name), serde_json::to_vec_pretty(&meta)?)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Probe {
        prepared: PlMutex<Option<Checkpoint>>,
        committed: PlMutex<Option<Checkpoint>>,
        aborted: PlMutex<Vec<Checkpoint>>,
        restored: PlMutex<Option<Checkpoint>>,
        fail_prepare: bool,
    }

    impl CheckpointParticipant for Probe {
        fn guarantee(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
            if *self.committed.lock() == Some(checkpoint) {
                return Ok(());
            }
            if *self.prepared.lock() == Some(checkpoint) {
                return self.commit(checkpoint);
            }
            Err(MptError::corrupt("cannot guarantee"))
        }

        fn prepare(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
            if self.fail_prepare {
                return Err(MptError::corrupt("prepare refused"));
            }
            *self.prepared.lock() = Some(checkpoint);
            Ok(())
        }

        fn commit(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
            assert_eq!(*self.prepared.lock(), Some(checkpoint));
            *self.committed.lock() = Some(checkpoint);
            *self.prepared.lock() = None;
            Ok(())
        }

        fn abort(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
            self.aborted.lock().push(checkpoint);
            *self.prepared.lock() = None;
            Ok(())
        }

        fn restore(&self, checkpoint: Checkpoint) -> Result<(), MptError> {
            *self.restored.lock() = Some(checkpoint);
            Ok(())
        }
    }

    #[test]
    fn checkpoint_numbers_increase() {
        let dir = TempDir::new().unwrap();
        let coordinator = CheckpointCoordinator::open(dir.path()).unwrap();
        let a = Probe::default();
        let b = Probe::default();
        let parts: [&dyn CheckpointParticipant; 2] = [&a, &b];

        coordinator.initialize(&parts).unwrap();
        assert_eq!(coordinator.create_checkpoint(&parts).unwrap(), 1);
        assert_eq!(coordinator.create_checkpoint(&parts).unwrap(), 2);
        assert_eq!(*a.committed.lock(), Some(2));
        assert_eq!(*b.committed.lock(), Some(2));
    }

    #[test]
    fn failed_prepare_aborts_everywhere() {
        let dir = TempDir::new().unwrap();
        let coordinator = CheckpointCoordinator::open(dir.path()).unwrap();
        let good = Probe::default();
        let bad = Probe {
            fail_prepare: true,
            ..Default::default()
        };
        let parts: [&dyn CheckpointParticipant; 2] = [&good, &bad];

        assert!(coordinator.create_checkpoint(&parts).is_err());
        assert_eq!(coordinator.committed(), 0);
        assert_eq!(*good.aborted.lock(), vec![1]);
        assert_eq!(*good.committed.lock(), None);
    }

    #[test]
    fn restore_rolls_a_decided_checkpoint_forward() {
        let dir = TempDir::new().unwrap();
        // simulate a crash between the decision record and the commits
        write_marker(dir.path(), COMMITTED_MARKER, CoordinatorMeta { checkpoint: 3 }).unwrap();
        write_marker(dir.path(), PREPARE_MARKER, CoordinatorMeta { checkpoint: 4 }).unwrap();

        let coordinator = CheckpointCoordinator::open(dir.path()).unwrap();
        let probe = Probe::default();
        *probe.prepared.lock() = Some(4);
        let parts: [&dyn CheckpointParticipant; 1] = [&probe];

        assert_eq!(coordinator.restore(&parts).unwrap(), 4);
        assert_eq!(*probe.committed.lock(), Some(4));
        assert_eq!(*probe.restored.lock(), Some(4));
        assert_eq!(coordinator.committed(), 4);
    }

    #[test]
    fn restore_aborts_an_undecided_checkpoint() {
        let dir = TempDir::new().unwrap();
        write_marker(dir.path(), COMMITTED_MARKER, CoordinatorMeta { checkpoint: 3 }).unwrap();

        let coordinator = CheckpointCoordinator::open(dir.path()).unwrap();
        let probe = Probe::default();
        *probe.prepared.lock() = Some(4);
        let parts: [&dyn CheckpointParticipant; 1] = [&probe];

        assert_eq!(coordinator.restore(&parts).unwrap(), 3);
        assert!(probe.aborted.lock().contains(&4));
        assert_eq!(*probe.restored.lock(), Some(3));
    }
}
