pub mod apply;
pub mod eval;
pub mod expr;

pub use apply::{
    CompiledTransform, ErrorThrottle, RequestParts, ResponseParts, TransformError, TransformSpec,
    apply_request, apply_response, expand_template,
};
pub use eval::{EvalError, EvalLimits, Scope, eval, to_display};
pub use expr::{Expr, ParseError, Program};
