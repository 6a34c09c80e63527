//! Node-resident management agent: registers with a controller, serves an
//! authenticated RPC surface, and runs cross-host command piping (CHP),
//! cross-host file transfer (CFT) and long-term command (LTC) workers.

pub mod cfgfile;
pub mod config;
pub mod controller_client;
pub mod defaults;
pub mod hostinfo;
pub mod ip_util;
pub mod osglue;
pub mod pg;
pub mod register;
pub mod rpc;
pub mod shutdown;
pub mod task;
