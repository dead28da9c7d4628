pub mod inspect;
pub mod query;

pub use inspect::{
    BackendsCommand, ColumnsCommand, DatabasesCommand, HelpersCommand, SchemaCommand,
};
pub use query::QueryCommand;
