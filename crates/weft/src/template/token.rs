use bytes::Bytes;

use crate::fragment::FragmentAttributes;

/// One parsed unit of a page template.
#[derive(Debug, Clone)]
pub enum TemplateToken {
    /// Literal bytes emitted verbatim.
    Raw(Bytes),
    /// Placeholder for one upstream fragment.
    Fragment(FragmentAttributes),
    /// Named insertion point resolved from the request context.
    Slot(String),
}
