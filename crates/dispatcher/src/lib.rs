pub mod dispatcher;
pub mod handler;
pub mod handlers;
pub mod registry;
pub mod response;

pub use dispatcher::{Dispatcher, DispatcherSettings};
pub use handler::{ChunkPublisher, Handler, HandlerContext};
pub use handlers::{build_http_handlers, HttpForwardHandler, RequiredFields, SseTextDecoder};
pub use registry::{HandlerRegistry, Route, RouteMode, RouteTable};
pub use response::Outcome;
