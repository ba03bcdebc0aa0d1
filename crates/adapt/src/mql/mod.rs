pub mod ast;
pub mod compile;
pub mod eval;
pub mod mongo;
pub mod parser;
pub mod scan;
pub mod sql;

pub use ast::{CmpOp, FieldExpr, Filter, Query, SortDir};
pub use compile::{
    compile, CompiledQuery, Emitter, GuardRule, IndexConstraint, NativeQuery, TypeGuard,
};
pub use eval::{eval_cmp, eval_filter};
pub use mongo::MongoFind;
pub use parser::{parse_filter, parse_query};
pub use sql::SqlQuery;
