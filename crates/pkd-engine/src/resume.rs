//! Safe start offsets for (re)started jobs.
//!
//! A resumed transfer continues exactly where the destination's durable
//! bytes end. Whenever that position cannot be trusted the partial is
//! discarded and the job restarts from zero.

use crate::job::TransferRequest;
use pkd_core::{
    Direction, ErrorKind, LocalFilesystem, ProtocolSession, TransferError, TransferResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The session cannot seek in this direction.
    Unsupported,
    /// Source size is unknown, so the partial cannot be checked.
    UnknownSource,
    /// The partial is larger than the source.
    Oversized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePlan {
    pub offset: u64,
    /// Discard existing destination content before writing.
    pub truncate: bool,
    pub source_size: Option<u64>,
    pub discarded: Option<DiscardReason>,
}

impl ResumePlan {
    fn fresh(source_size: Option<u64>) -> Self {
        Self {
            offset: 0,
            truncate: true,
            source_size,
            discarded: None,
        }
    }

    fn discard(source_size: Option<u64>, reason: DiscardReason) -> Self {
        Self {
            discarded: Some(reason),
            ..Self::fresh(source_size)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeManager {
    pub enabled: bool,
}

impl ResumeManager {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Decide the start offset from what is known about both ends.
    pub fn plan(&self, partial: Option<u64>, source_size: Option<u64>, supported: bool) -> ResumePlan {
        let partial = match partial {
            Some(n) if self.enabled && n > 0 => n,
            _ => return ResumePlan::fresh(source_size),
        };
        let Some(source) = source_size else {
            return ResumePlan::discard(None, DiscardReason::UnknownSource);
        };
        if !supported {
            return ResumePlan::discard(source_size, DiscardReason::Unsupported);
        }
        if partial > source {
            return ResumePlan::discard(source_size, DiscardReason::Oversized);
        }
        ResumePlan {
            offset: partial,
            truncate: false,
            source_size,
            discarded: None,
        }
    }

    /// Stat both ends of `request` and plan the start offset.
    pub async fn prepare(
        &self,
        session: &mut dyn ProtocolSession,
        local: &dyn LocalFilesystem,
        request: &TransferRequest,
    ) -> TransferResult<ResumePlan> {
        let supported = session.capabilities().supports_resume(request.direction);
        let (source_size, partial) = match request.direction {
            Direction::Download => {
                let entry = session.stat(&request.remote_path).await?;
                if entry.is_dir() {
                    return Err(TransferError::invalid_job(format!(
                        "{} is a directory",
                        request.remote_path
                    )));
                }
                let partial = if self.enabled {
                    local
                        .stat(&request.local_path)
                        .await?
                        .filter(|s| !s.is_dir)
                        .map(|s| s.size)
                } else {
                    None
                };
                (entry.size, partial)
            }
            Direction::Upload => {
                let source = local.stat(&request.local_path).await?.ok_or_else(|| {
                    TransferError::invalid_path(format!(
                        "{} does not exist",
                        request.local_path.display()
                    ))
                })?;
                if source.is_dir {
                    return Err(TransferError::invalid_job(format!(
                        "{} is a directory",
                        request.local_path.display()
                    )));
                }
                let partial = if self.enabled {
                    match session.stat(&request.remote_path).await {
                        Ok(entry) if !entry.is_dir() => entry.size,
                        Ok(_) => None,
                        Err(e) if e.kind == ErrorKind::NotFound => None,
                        Err(e) => return Err(e),
                    }
                } else {
                    None
                };
                (Some(source.size), partial)
            }
        };

        let plan = self.plan(partial, source_size, supported);
        if let Some(reason) = plan.discarded {
            tracing::info!(
                dest = %request.destination(),
                partial = ?partial,
                source = ?source_size,
                reason = ?reason,
                "discarding partial destination"
            );
        } else if plan.offset > 0 {
            tracing::debug!(dest = %request.destination(), offset = plan.offset, "resuming");
        }
        Ok(plan)
    }
}
