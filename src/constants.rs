pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_READY_MS: u64 = 10_000;
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
    pub const TIMEOUT_EXEC_DEFAULT_MS: u64 = 30_000;
    pub const TIMEOUT_EXEC_KILL_GRACE_MS: u64 = 2_000;
    pub const TIMEOUT_TUNNEL_OPEN_MS: u64 = 10_000;
    pub const TIMEOUT_HOST_LOCK_WAIT_MS: u64 = 120_000;
    pub const TIMEOUT_HANDSHAKE_SETTLE_MS: u64 = 2_000;
    pub const CHANNEL_POLL_IDLE_MS: u64 = 10;
}

pub mod limits {
    pub const MAX_CONCURRENT_CONNECTIONS: usize = 5;
    pub const CONNECTION_POOL_SIZE: usize = 10;
    pub const MAX_OUTPUT_BYTES: usize = 5 * 1024 * 1024;
    pub const MAX_LINE_BUFFER_BYTES: usize = 64 * 1024;
    pub const CHANNEL_EVENT_CAPACITY: usize = 64;
    pub const READ_CHUNK_BYTES: usize = 8192;
}

pub mod retry {
    pub const ATTEMPTS: usize = 3;
    pub const DELAY_MS: u64 = 1_000;
}

pub mod stream {
    pub const STOP_GRACE_MS: u64 = 1_000;
    pub const INTERRUPT: &[u8] = b"\x03";
}

pub mod status {
    pub const BACKUP_SUFFIX: &str = "bak";
}
