//! Process-wide defaults, named the way `safekeeper::defaults` names them.

use std::time::Duration;

pub const DEFAULT_AGENT_RPC_PORT: u16 = 4243;
pub const DEFAULT_RPC_THREAD_POOL_SIZE: usize = 10;

pub const DEFAULT_LTC_OUTPUT_QSIZE: usize = 10;
pub const DEFAULT_LTC_OUTPUT_TIMEOUT: Duration = Duration::from_secs(600);
pub const LTC_STDERR_EMPTY_READ_LIMIT: u32 = 20;

pub const CHP_STDOUT_CHUNK: usize = 512 * 1024;
pub const CHP_STDERR_CHUNK: usize = 384 * 1024;
pub const CHP_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);
pub const CHP_TASK_TTL: Duration = Duration::from_secs(24 * 3600);
pub const CHP_PIPE_OUT_TASK_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

pub const CFT_BIG_FILE_SIZE: u64 = 768 * 1024;
pub const CFT_TRANS_BLOCK_SIZE: usize = 512 * 1024;
pub const CFT_BATCH_MAX_ENTRIES: usize = 100;
pub const CFT_TASK_TTL: Duration = Duration::from_secs(24 * 3600);
pub const CFT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

pub const CONTROLLER_ELECTION_CACHE_TTL: Duration = Duration::from_secs(60);
pub const CONTROLLER_ELECTION_QUORUM: usize = 2;

pub const REGISTER_RETRY_SLEEP: Duration = Duration::from_secs(30);

pub const SHUTDOWN_DRAIN_RETRIES: u32 = 30;
pub const SHUTDOWN_DRAIN_POLL: Duration = Duration::from_millis(300);

pub const DEFAULT_CONFIG_RELATIVE_PATH: &str = "conf/clup-agent.conf";
pub const PID_FILE_NAME: &str = "clup-agent.pid";
