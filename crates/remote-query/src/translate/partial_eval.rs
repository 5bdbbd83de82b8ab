//! Local evaluation of parameter-free sub-trees.
//!
//! Anything that does not depend on a lambda parameter or a data source is
//! computed in-process before translation, so process-local functions and
//! captured objects never have to cross the wire.

use crate::error::QueryResult;
use crate::eval::evaluate;
use crate::native::NativeExpr;

fn is_leaf(expr: &NativeExpr) -> bool {
    matches!(
        expr,
        NativeExpr::Constant { .. }
            | NativeExpr::Captured { .. }
            | NativeExpr::Source(_)
            | NativeExpr::Resource { .. }
            | NativeExpr::Parameter(_)
    )
}

fn depends_on_query(expr: &NativeExpr) -> bool {
    expr.any(&|e| {
        matches!(
            e,
            NativeExpr::Parameter(_) | NativeExpr::Source(_) | NativeExpr::Resource { .. } | NativeExpr::Lambda(_)
        )
    })
}

fn can_fold(expr: &NativeExpr) -> bool {
    if is_leaf(expr) || depends_on_query(expr) {
        return false;
    }
    // A widening conversion of a single captured value stays visible.
    if let NativeExpr::Convert { operand, .. } = expr {
        if matches!(operand.as_ref(), NativeExpr::Constant { .. } | NativeExpr::Captured { .. }) {
            return false;
        }
    }
    true
}

fn is_captured(expr: &NativeExpr) -> bool {
    expr.any(&|e| match e {
        NativeExpr::Captured { .. } => true,
        NativeExpr::Call { method, .. } => method.is_local(),
        _ => false,
    })
}

/// Replaces every maximal foldable sub-tree with its computed value.
pub fn evaluate_locally(expr: NativeExpr) -> QueryResult<NativeExpr> {
    if can_fold(&expr) {
        let ty = expr.ty();
        let value = evaluate(&expr)?;
        tracing::trace!("Folded {} into a {} value", expr.node_name(), ty);
        return Ok(if is_captured(&expr) {
            NativeExpr::Captured { value, ty }
        } else {
            NativeExpr::Constant { value, ty }
        });
    }
    expr.map_children(evaluate_locally)
}
