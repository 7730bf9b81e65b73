pub mod config;
pub mod filter;
pub mod meta;
pub mod npu;
pub mod packet_io;
pub mod port;
pub mod reactor;
pub mod tap;
pub mod test_util;
