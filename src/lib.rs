pub mod action;
pub mod canon;
pub mod densemap;
pub mod digestcache;
pub mod exec;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod load;
pub mod logging;
pub mod nodestate;
pub mod printing;
pub mod queue;
pub mod resources;
pub mod run;
pub mod scancache;
pub mod scanner;
pub mod signal;
pub mod signature;
pub mod smallmap;
pub mod statcache;
pub mod statefile;
pub mod structlog;
pub mod sweep;
pub mod throttle;
pub mod validation;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
