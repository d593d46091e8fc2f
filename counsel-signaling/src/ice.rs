use std::collections::VecDeque;

use crate::signal::IceCandidate;

/// What the caller should do with a candidate handed to [`IceBuffer::accept`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceDisposition {
    /// The remote description is set; apply the candidate now.
    Apply(IceCandidate),
    /// Held until [`IceBuffer::flush`].
    Queued,
}

/// Holds remote ICE candidates until the remote description exists.
///
/// Candidates are released in arrival order by a single `flush`; after that
/// every new candidate passes straight through.
#[derive(Debug, Default)]
pub struct IceBuffer {
    pending: VecDeque<IceCandidate>,
    remote_description_set: bool,
}

impl IceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, candidate: IceCandidate) -> IceDisposition {
        if self.remote_description_set {
            IceDisposition::Apply(candidate)
        } else {
            self.pending.push_back(candidate);
            IceDisposition::Queued
        }
    }

    /// Marks the remote description as set and drains the queue. Only the
    /// first call returns anything.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.pending.drain(..).collect()
    }

    pub fn is_flushed(&self) -> bool {
        self.remote_description_set
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_preserves_arrival_order() {
        let mut buffer = IceBuffer::new();
        for name in ["c1", "c2", "c3"] {
            assert_eq!(buffer.accept(IceCandidate::new(name)), IceDisposition::Queued);
        }
        assert_eq!(buffer.queued(), 3);

        let flushed: Vec<String> = buffer.flush().into_iter().map(|c| c.candidate).collect();
        assert_eq!(flushed, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_flush_happens_once() {
        let mut buffer = IceBuffer::new();
        buffer.accept(IceCandidate::new("c1"));

        assert_eq!(buffer.flush().len(), 1);
        assert!(buffer.flush().is_empty());
        assert!(buffer.is_flushed());
    }

    #[test]
    fn test_candidates_after_flush_pass_through() {
        let mut buffer = IceBuffer::new();
        buffer.flush();

        assert_eq!(
            buffer.accept(IceCandidate::new("late")),
            IceDisposition::Apply(IceCandidate::new("late"))
        );
        assert_eq!(buffer.queued(), 0);
    }
}
