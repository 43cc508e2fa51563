//! The credit triple shared by every flow controlled direction.
//!
//! `sequence` counts bytes (plus padding) sent, `acknowledge` counts bytes
//! the receiver has released, and `maximum` is the receiver's buffer. The
//! invariant `acknowledge <= sequence <= acknowledge + maximum` holds after
//! every mutation.

use crate::error::FabricError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub sequence: u64,
    pub acknowledge: u64,
    pub maximum: u32,
    pub padding: u32,
}

impl Window {
    pub fn new(sequence: u64, acknowledge: u64, maximum: u32) -> Self {
        let window = Self { sequence, acknowledge, maximum, padding: 0 };
        debug_assert!(window.is_valid(), "{window:?}");
        window
    }

    /// Bytes sent but not yet acknowledged.
    #[inline]
    pub fn pending(&self) -> u64 {
        self.sequence - self.acknowledge
    }

    /// Credit left before the receiver's buffer is full, may be negative
    /// after the receiver shrinks its buffer.
    #[inline]
    pub fn available(&self) -> i64 {
        i64::from(self.maximum) - self.pending() as i64
    }

    /// Payload bytes that fit once padding is accounted for.
    #[inline]
    pub fn writable(&self) -> usize {
        usize::try_from((self.available() - i64::from(self.padding)).max(0)).unwrap_or(0)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.acknowledge <= self.sequence && self.sequence <= self.acknowledge + u64::from(self.maximum)
    }

    /// Records `reserved` bytes sent.
    pub fn advance(&mut self, reserved: u32) {
        self.sequence += u64::from(reserved);
        debug_assert!(self.is_valid(), "{self:?}");
    }

    /// Records incoming data claiming `reserved` bytes at `sequence`.
    ///
    /// Fails when the sender overran the window it was granted.
    pub fn receive(&mut self, sequence: u64, reserved: u32) -> Result<(), FabricError> {
        crate::ensure!(sequence >= self.sequence, FabricError::window(format!("sequence {sequence} < {}", self.sequence)));

        let next = sequence + u64::from(reserved);
        crate::ensure!(
            next <= self.acknowledge + u64::from(self.maximum),
            FabricError::window(format!("{next} > {} + {}", self.acknowledge, self.maximum))
        );

        self.sequence = next;
        Ok(())
    }

    /// Applies a window update received from the peer.
    ///
    /// Acknowledge and maximum only grow.
    pub fn observe(&mut self, acknowledge: u64, maximum: u32, padding: u32) -> Result<(), FabricError> {
        crate::ensure!(
            acknowledge >= self.acknowledge && acknowledge <= self.sequence,
            FabricError::window(format!("acknowledge {acknowledge} outside {}..={}", self.acknowledge, self.sequence))
        );
        crate::ensure!(
            maximum >= self.maximum,
            FabricError::window(format!("maximum {maximum} < {}", self.maximum))
        );

        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self.padding = padding;
        Ok(())
    }

    /// Updates the credit this side grants, acknowledge never moves back.
    pub fn grant(&mut self, acknowledge: u64, maximum: u32) {
        debug_assert!(acknowledge >= self.acknowledge, "{acknowledge} < {}", self.acknowledge);
        self.acknowledge = acknowledge.min(self.sequence).max(self.acknowledge);
        self.maximum = maximum;
    }

    /// Starts over from the given sequence, used when a stream is reopened.
    pub fn reset(&mut self, sequence: u64) {
        *self = Self { sequence, acknowledge: sequence, maximum: 0, padding: 0 };
    }
}
