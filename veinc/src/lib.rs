//! # Vein Memory Strategy Compiler
//!
//! Compile-time analysis that chooses, for every allocation site, how its
//! memory is reclaimed, and emits the matching runtime calls.
//!
//! ## Pipeline
//!
//! ```text
//! TypeGraph -> Back-Edge Detection
//! Body      -> Escape -> Liveness -> Shape -> Router -> Plan -> Lowering
//! ```
//!
//! Every choice is made statically. The runtime (`vein-runtime`) only
//! executes the calls the plan asks for.
//!
//! ## Quick Start
//!
//! ```rust
//! use veinc::mir::{Body, Place, Rvalue, SiteId, Statement, TerminatorKind};
//! use veinc::{render_c, MemoryPlanner, TypeGraph};
//!
//! let mut graph = TypeGraph::new();
//! let node = graph.add_type("Node");
//! graph.add_ref(node, "next", node).unwrap();
//!
//! let mut body = Body::new("build", 0);
//! let x = body.new_var("x", Some(node));
//! let bb = body.new_block();
//! body.push_statement(bb, Statement::assign(
//!     Place::local(x),
//!     Rvalue::Alloc { site: SiteId(0), ty: node, frozen: false, fields: vec![] },
//! ));
//! body.set_terminator(bb, TerminatorKind::Return);
//!
//! let planner = MemoryPlanner::default();
//! let unit = planner.plan_unit(&mut graph, &[body]).unwrap();
//! println!("{}", render_c(&unit.bodies[0]).unwrap());
//! ```
//!
//! ## Module Overview
//!
//! - [`types`] - Type graph: types, reference fields and strengths
//! - [`mir`] - Control-flow-graph IR the analyses run on
//! - [`backedge`] - Weak-field detection
//! - [`shape`] - TREE / DAG / CYCLIC classification
//! - [`escape`] - Escape analysis
//! - [`liveness`] - Last-use and death points
//! - [`router`] - Strategy selection
//! - [`plan`] - Per-site plans and call placement
//! - [`lower`] - Rendering plans as runtime calls

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod backedge;
pub mod config;
pub mod error;
pub mod escape;
pub mod liveness;
pub mod lower;
pub mod mir;
pub mod plan;
pub mod router;
pub mod shape;
pub mod types;

// Re-export commonly used types
pub use backedge::{BackEdgeDetector, BackEdgeReport, WeakReason};
pub use config::AnalysisConfig;
pub use error::{AnalysisError, AnalysisResult};
pub use escape::{classify_escape, EscapeAnalyzer, EscapeResults, EscapeState};
pub use liveness::{compute_liveness, DeathPoint, LivenessResults};
pub use lower::{lower_plan, render_c, LoweredCall};
pub use plan::{AllocationSite, MemoryPlan, MemoryPlanner, PlannedCall, ProgramPoint, UnitPlan};
pub use router::{choose_strategy, route, RouteDecision, RouteInput, RouteOptions, RouteReason};
pub use shape::{classify_shape, Shape, ShapeFact};
pub use types::{Annotation, FieldId, FieldTarget, Strength, TypeGraph, TypeId};
pub use vein_abi::{RuntimeFn, Strategy};
