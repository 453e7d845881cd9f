//! Output module
//!
//! Console handling, the spec writer, output interception and reporting.

mod console;
mod interceptor;
mod report_file;
mod reporter;
mod writer;

pub use console::{Console, SharedBuffer};
pub use interceptor::{
    InterceptorMode, NoopOutputInterceptor, OutputInterceptor, RedirectOutputInterceptor,
    SwapOutputInterceptor,
};
pub use report_file::generate_json_report;
pub use reporter::{DefaultReporter, NoopReporter, Reporter};
pub use writer::{Writer, WriterMode};
