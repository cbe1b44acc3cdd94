mod dispatcher;
pub mod lttb;
mod observation;
mod request;

pub use dispatcher::*;
pub use observation::*;
pub use request::*;
