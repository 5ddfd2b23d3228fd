//! Rule resolution subsystem.
//!
//! # Data Flow
//! ```text
//! ModelSnapshot (rules, rule sets, groups, nodes)
//!     → resolver.rs (order by position, expand rule sets, validate groups)
//!     → table.rs (RoutingTable: ordered matcher → target list)
//!     → compilers
//! ```
//!
//! # Design Decisions
//! - Explicit position is the only ordering mechanism; matchers are never
//!   reordered by kind or specificity
//! - Any invalid group or reference fails the whole resolution

pub mod matcher;
pub mod resolver;
pub mod table;

pub use matcher::{Destination, Matcher};
pub use resolver::{expand_aggregation, resolve, resolve_parts, Resolution, ResolveError, ResolvedGroup, ResolvedMember};
pub use table::{Route, RouteOrigin, RoutingTable};
