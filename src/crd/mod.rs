mod backend_group;
mod backend_record;
mod bind;
mod common;
mod driver;
mod load_balancer;

pub use backend_group::*;
pub use backend_record::*;
pub use bind::*;
pub use common::*;
pub use driver::*;
pub use load_balancer::*;
