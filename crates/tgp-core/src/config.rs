use serde::{Deserialize, Serialize};

/// Protocol-wide limits shared by every gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolLimits {
    /// Maximum number of domains in an advertised path.
    pub max_path_len: usize,
    /// Maximum encoded frame size in bytes.
    pub max_frame_len: usize,
    /// Protocol version announced in OPEN.
    pub version: u16,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            max_path_len: 16,
            max_frame_len: crate::codec::MAX_FRAME_LEN,
            version: 1,
        }
    }
}
