use serde::{Deserialize, Serialize};

/// Default multiplier applied to the minimum receive buffer size.
pub const DEFAULT_RECEIVE_MULTIPLIER: usize = 40;
/// Default multiplier applied to the minimum send buffer size.
pub const DEFAULT_SEND_MULTIPLIER: usize = 10;

/// Caller-supplied socket buffer preferences.
///
/// Explicit sizes smaller than what the interface needs are raised to the
/// minimum. The operating system may silently cap the result
/// (`kern.ipc.maxsockbuf`, `net.core.rmem_max`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketOptions {
    /// `SO_RCVBUF`
    #[serde(default)]
    pub receive_buffer_size: Option<usize>,
    /// `SO_SNDBUF`
    #[serde(default)]
    pub send_buffer_size: Option<usize>,
    #[serde(default)]
    pub receive_multiplier: Option<usize>,
    #[serde(default)]
    pub send_multiplier: Option<usize>,
}

impl SocketOptions {
    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    pub fn receive_multiplier(mut self, multiplier: usize) -> Self {
        self.receive_multiplier = Some(multiplier);
        self
    }

    pub fn send_multiplier(mut self, multiplier: usize) -> Self {
        self.send_multiplier = Some(multiplier);
        self
    }

    /// Resolve the buffer sizes given the minimums a framing requires.
    pub fn resolve(&self, min_send: usize, min_recv: usize) -> BufferSizes {
        let recv_multiplier = self
            .receive_multiplier
            .unwrap_or(DEFAULT_RECEIVE_MULTIPLIER)
            .max(1);
        let send_multiplier = self
            .send_multiplier
            .unwrap_or(DEFAULT_SEND_MULTIPLIER)
            .max(1);

        let receive = match self.receive_buffer_size {
            Some(size) if size > 0 => size.max(min_recv),
            _ => min_recv.saturating_mul(recv_multiplier),
        };
        let send = match self.send_buffer_size {
            Some(size) if size > 0 => size.max(min_send),
            _ => min_send.saturating_mul(send_multiplier),
        };
        BufferSizes { receive, send }
    }
}

/// Socket buffer sizes to request from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSizes {
    pub receive: usize,
    pub send: usize,
}
