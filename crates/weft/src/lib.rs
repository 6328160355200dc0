//! Streaming HTML fragment composition.
//!
//! For each page request the engine fetches a template, discovers fragment
//! placeholders, fetches every fragment concurrently from its upstream, and
//! streams one assembled document, flushing bytes while fragments are still
//! in flight. Inline fragments land in template order; async fragments land
//! in a trailing section; a single primary fragment may promote its status
//! and headers to the page response.

pub mod compose;
pub mod config;
pub mod error;
pub mod events;
pub mod fragment;
pub mod stream;
pub mod template;

pub use compose::{
    ComposeRequest, ComposedResponse, Composer, Context, ContextFetcher, NoResponseHeaders,
    ResponseHeaderFilter, StaticContext, TemplateFetcher,
};
pub use config::ComposerConfig;
pub use error::{ComposeError, FragmentErrorKind};
pub use events::{ComposeEvent, EventSink, FragmentEvent, FragmentEventKind};
pub use template::{TemplateParser, TemplateToken};
