//! Lowering of memory plans to runtime calls.
//!
//! Each [`PlannedCall`] becomes a [`LoweredCall`] whose symbol and argument
//! count come from [`vein_abi::RuntimeFn`], so the code generator and the
//! runtime cannot disagree about names or arity.

use std::fmt;

use vein_abi::{AbiType, RuntimeFn, Strategy};

use crate::error::{AnalysisError, AnalysisResult};
use crate::plan::{AllocationSite, MemoryPlan, PlannedCall, ProgramPoint};

/// Name of the per-body arena variable in lowered code.
pub const ARENA_VAR: &str = "__vein_arena";

/// A runtime call with rendered operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweredCall {
    /// Placement.
    pub point: ProgramPoint,
    /// Runtime entry point.
    pub func: RuntimeFn,
    /// Rendered arguments, one per parameter.
    pub args: Vec<String>,
    /// Destination of the result, if it is kept.
    pub result: Option<String>,
}

impl LoweredCall {
    /// The C statement for this call.
    pub fn statement(&self) -> String {
        let call = format!("{}({});", self.func.symbol(), self.args.join(", "));
        match &self.result {
            Some(dst) => format!("{dst} = {call}"),
            None => call,
        }
    }
}

impl fmt::Display for LoweredCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.point, self.statement())
    }
}

/// Lower every call in a plan.
pub fn lower_plan(plan: &MemoryPlan) -> AnalysisResult<Vec<LoweredCall>> {
    plan.calls.iter().map(|call| lower_call(plan, call)).collect()
}

/// Render a plan as commented C, one call per line.
pub fn render_c(plan: &MemoryPlan) -> AnalysisResult<String> {
    let mut out = format!("/* {} */\n", plan.body);
    for call in lower_plan(plan)? {
        out.push_str(&format!("/* {} */ {}\n", call.point, call.statement()));
    }
    Ok(out)
}

fn lower_call(plan: &MemoryPlan, call: &PlannedCall) -> AnalysisResult<LoweredCall> {
    let site = call.site.and_then(|id| plan.site(id));
    let local = call.local.map(|l| l.to_string());
    let object = || local.clone().unwrap_or_else(|| "NULL".to_string());

    let (args, result) = match call.func {
        RuntimeFn::Alloc => {
            let site = require_site(call, site)?;
            let shared = u8::from(site.decision.atomic_rc);
            (vec![type_tag(site), shared.to_string()], Some(site.place.to_string()))
        }
        RuntimeFn::SlotPoolAlloc => {
            let site = require_site(call, site)?;
            let shared = u8::from(site.decision.atomic_rc);
            let symmetric = u8::from(site.strategy() == Strategy::SymmetricRc);
            (
                vec![type_tag(site), shared.to_string(), symmetric.to_string()],
                Some(site.place.to_string()),
            )
        }
        RuntimeFn::SymAlloc => {
            let site = require_site(call, site)?;
            (vec![type_tag(site)], Some(site.place.to_string()))
        }
        RuntimeFn::ArenaAlloc => {
            let site = require_site(call, site)?;
            (vec![ARENA_VAR.to_string(), type_tag(site)], Some(site.place.to_string()))
        }
        RuntimeFn::ArenaCreate => (Vec::new(), Some(ARENA_VAR.to_string())),
        RuntimeFn::ArenaDestroy => (vec![ARENA_VAR.to_string()], None),
        RuntimeFn::MakeHandle => {
            let obj = object();
            (vec![obj.clone()], Some(format!("{obj}_handle")))
        }
        RuntimeFn::SymEnterScope | RuntimeFn::SymExitScope | RuntimeFn::SafePoint => {
            (Vec::new(), None)
        }
        RuntimeFn::FreeTree
        | RuntimeFn::IncRef
        | RuntimeFn::DecRef
        | RuntimeFn::SccFreeze
        | RuntimeFn::SccRelease
        | RuntimeFn::SymAcquire
        | RuntimeFn::SymRelease
        | RuntimeFn::SlotPoolFree => (vec![object()], None),
        RuntimeFn::RuntimeInit
        | RuntimeFn::RegisterType
        | RuntimeFn::SetField
        | RuntimeFn::ArenaRegisterExternal
        | RuntimeFn::ArenaResolveExternal
        | RuntimeFn::SymLink
        | RuntimeFn::HandleIsValid
        | RuntimeFn::HandleDeref => (Vec::new(), None),
    };

    check_arity(call.func, args.len())?;
    let result = result.filter(|_| call.func.signature().ret != AbiType::Void);

    Ok(LoweredCall {
        point: call.point,
        func: call.func,
        args,
        result,
    })
}

fn require_site<'a>(
    call: &PlannedCall,
    site: Option<&'a AllocationSite>,
) -> AnalysisResult<&'a AllocationSite> {
    site.ok_or(AnalysisError::AbiArity {
        symbol: call.func.symbol(),
        expected: call.func.signature().params.len(),
        found: 0,
    })
}

fn type_tag(site: &AllocationSite) -> String {
    site.ty.index().to_string()
}

/// Check a call's argument count against the ABI signature.
pub fn check_arity(func: RuntimeFn, found: usize) -> AnalysisResult<()> {
    let expected = func.signature().params.len();
    if expected == found {
        Ok(())
    } else {
        Err(AnalysisError::AbiArity {
            symbol: func.symbol(),
            expected,
            found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{Body, LocalId, Place, Rvalue, SiteId, Statement, TerminatorKind};
    use crate::plan::MemoryPlanner;
    use crate::types::TypeGraph;

    fn tree_plan() -> MemoryPlan {
        let mut graph = TypeGraph::new();
        let node = graph.add_type("Node");
        graph.add_scalar(node, "value").unwrap();
        let mut body = Body::new("tree", 0);
        let x = body.new_var("x", Some(node));
        let bb = body.new_block();
        body.push_statement(
            bb,
            Statement::assign(
                Place::local(x),
                Rvalue::Alloc {
                    site: SiteId(0),
                    ty: node,
                    frozen: false,
                    fields: Vec::new(),
                },
            ),
        );
        body.set_terminator(bb, TerminatorKind::Return);
        let planner = MemoryPlanner::default();
        planner.prepare(&mut graph).unwrap();
        planner.plan(&graph, &body).unwrap()
    }

    #[test]
    fn test_lower_tree() {
        let plan = tree_plan();
        let calls = lower_plan(&plan).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].statement(), "_1 = vein_alloc(0, 0);");
        assert_eq!(calls[1].statement(), "vein_free_tree(_1);");
        assert_eq!(calls[1].to_string(), "after bb0[0]: vein_free_tree(_1);");
    }

    #[test]
    fn test_render_c() {
        let text = render_c(&tree_plan()).unwrap();
        assert!(text.starts_with("/* tree */\n"));
        assert!(text.contains("/* at bb0[0] */ _1 = vein_alloc(0, 0);"));
        assert!(text.contains("vein_free_tree(_1);"));
    }

    #[test]
    fn test_arity_check() {
        assert!(check_arity(RuntimeFn::DecRef, 1).is_ok());
        assert_eq!(
            check_arity(RuntimeFn::SymLink, 2),
            Err(AnalysisError::AbiArity {
                symbol: "vein_sym_link",
                expected: 3,
                found: 2,
            })
        );
    }

    #[test]
    fn test_unlowerable_call_rejected() {
        let mut plan = tree_plan();
        plan.calls.push(PlannedCall {
            point: ProgramPoint::Entry,
            func: RuntimeFn::SymLink,
            site: None,
            local: Some(LocalId::new(1)),
        });
        assert!(matches!(lower_plan(&plan), Err(AnalysisError::AbiArity { .. })));
    }
}
