pub mod content;
pub mod headers;
pub mod path;

pub use content::{ContentPipeline, Stage};
pub use headers::HeaderRules;
pub use path::JsonPath;
