//! Dual-partition boot selection.
//!
//! The record is a small value stored apart from the firmware images. Every
//! transition is a plain function of the current record and the boot outcome,
//! the platform layer only persists it and points the bootloader at
//! [`BootRecord::boot_target`].

use serde::{Deserialize, Serialize};

/// Unconfirmed boots of a candidate before the previous image is restored.
pub const MAX_BOOT_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub slot: Slot,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootState {
    Stable(Image),
    Candidate {
        image: Image,
        previous: Image, // rollback target, never erased while the candidate is unconfirmed
        boot_attempts: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootResult {
    Healthy,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("an update is already waiting for confirmation")]
    CandidatePending,
    #[error("candidate must go into the inactive slot {0:?}")]
    WrongSlot(Slot),
    #[error("nothing to confirm")]
    NothingToConfirm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRecord {
    pub state: BootState,
    pub rolled_back_from: Option<String>, // version, cleared once reported
    /// Last version that rolled back or failed verification. Survives restarts
    /// and reports; it is only replaced by the next failure.
    pub blocked_version: Option<String>,
}

impl BootRecord {
    pub fn stable(image: Image) -> Self {
        Self {
            state: BootState::Stable(image),
            rolled_back_from: None,
            blocked_version: None,
        }
    }

    pub fn boot_target(&self) -> Slot {
        match &self.state {
            BootState::Stable(image) => image.slot,
            BootState::Candidate { image, .. } => image.slot,
        }
    }

    /// The image that runs when [`Self::boot_target`] boots.
    pub fn current(&self) -> &Image {
        match &self.state {
            BootState::Stable(image) => image,
            BootState::Candidate { image, .. } => image,
        }
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self.state, BootState::Candidate { .. })
    }

    /// Marks a verified image in the inactive slot as the next boot target.
    pub fn stage(self, candidate: Image) -> Result<Self, BootError> {
        let BootState::Stable(running) = self.state else {
            return Err(BootError::CandidatePending);
        };
        if candidate.slot == running.slot {
            return Err(BootError::WrongSlot(running.slot.other()));
        }

        Ok(Self {
            state: BootState::Candidate {
                image: candidate,
                previous: running,
                boot_attempts: 0,
            },
            rolled_back_from: self.rolled_back_from,
            blocked_version: self.blocked_version,
        })
    }

    /// Outcome of starting the boot target. Runs below the application, a
    /// failed candidate falls back without any network involved.
    pub fn on_boot_result(self, result: BootResult) -> Self {
        match (self.state, result) {
            (
                BootState::Candidate {
                    image,
                    previous,
                    boot_attempts,
                },
                BootResult::Failed,
            ) => {
                let boot_attempts = boot_attempts.saturating_add(1);
                if boot_attempts >= MAX_BOOT_ATTEMPTS {
                    Self::rolled_back(previous, image.version)
                } else {
                    Self {
                        state: BootState::Candidate {
                            image,
                            previous,
                            boot_attempts,
                        },
                        rolled_back_from: self.rolled_back_from,
                        blocked_version: self.blocked_version,
                    }
                }
            }
            (state, _) => Self {
                state,
                rolled_back_from: self.rolled_back_from,
                blocked_version: self.blocked_version,
            },
        }
    }

    /// Aligns the record with the slot actually running. A candidate record
    /// while the previous slot runs means the bootloader reverted on its own.
    pub fn reconcile(self, running: Slot) -> Self {
        match self.state {
            BootState::Candidate {
                image, previous, ..
            } if running != image.slot && running == previous.slot => {
                Self::rolled_back(previous, image.version)
            }
            state => Self {
                state,
                rolled_back_from: self.rolled_back_from,
                blocked_version: self.blocked_version,
            },
        }
    }

    fn rolled_back(previous: Image, failed: String) -> Self {
        Self {
            state: BootState::Stable(previous),
            rolled_back_from: Some(failed.clone()),
            blocked_version: Some(failed),
        }
    }

    /// Promotes the running candidate to stable. The previous slot becomes reclaimable.
    pub fn confirm(self) -> Result<Self, BootError> {
        match self.state {
            BootState::Candidate { image, .. } => Ok(Self {
                state: BootState::Stable(image),
                rolled_back_from: None,
                blocked_version: self.blocked_version,
            }),
            BootState::Stable(_) => Err(BootError::NothingToConfirm),
        }
    }
}

/// Firmware partitions. Writes only ever target the inactive slot.
pub trait Partitions {
    fn running(&self) -> Slot;

    /// Prepares the inactive slot for an image of `size` bytes.
    fn begin(&mut self, size: u64) -> anyhow::Result<()>;
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;
    fn finish(&mut self) -> anyhow::Result<()>;
    /// Drops a partial write. The running slot is untouched.
    fn abort(&mut self);

    fn set_boot(&mut self, slot: Slot) -> anyhow::Result<()>;
    /// Cancels the bootloader's own rollback for the running slot.
    fn mark_running_valid(&mut self) -> anyhow::Result<()>;
}

pub trait BootStore {
    fn load_boot(&mut self) -> anyhow::Result<Option<BootRecord>>;
    fn store_boot(&mut self, record: &BootRecord) -> anyhow::Result<()>;
}
