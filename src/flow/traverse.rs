/// Tree traversal engine
///
/// Walks a step tree in pre-order: the step itself, then its kind-specific children
/// (router slots in order, branch success before failure, loop body), then `nextAction`.
/// Every function matches `StepBody` exhaustively so a new kind cannot be skipped silently.

use crate::flow::step::{Step, StepBody};

/// Apply `updater` to every step in place
///
/// Returns true if any call of `updater` reported a change. Every step is visited even
/// after a change has been reported.
pub fn traverse<F>(root: Option<&mut Step>, updater: &mut F) -> bool
where
    F: FnMut(&mut Step) -> bool,
{
    let Some(step) = root else {
        return false;
    };

    let mut changed = updater(step);

    match &mut step.body {
        StepBody::Router { children, .. } => {
            for child in children.iter_mut() {
                changed |= traverse(child.as_mut(), updater);
            }
        }
        StepBody::Branch { on_success_action, on_failure_action, .. } => {
            changed |= traverse(on_success_action.as_deref_mut(), updater);
            changed |= traverse(on_failure_action.as_deref_mut(), updater);
        }
        StepBody::LoopOnItems { first_loop_action, .. } => {
            changed |= traverse(first_loop_action.as_deref_mut(), updater);
        }
        StepBody::Empty { .. }
        | StepBody::Code { .. }
        | StepBody::Piece { .. }
        | StepBody::PieceTrigger { .. }
        | StepBody::Webhook { .. }
        | StepBody::Missing { .. }
        | StepBody::Unknown { .. } => {}
    }

    changed |= traverse(step.next_action.as_deref_mut(), updater);
    changed
}

/// Rebuild the tree by passing every step through `updater`
///
/// The updater sees each step before its children, so children are walked according to
/// the step the updater returned (a legacy branch rewritten into a router has its router
/// slots walked). Returning `None` prunes the step together with everything it owns; a
/// pruned router child leaves an empty slot behind so branch positions stay aligned.
pub fn transform<F>(root: Option<Step>, updater: &mut F) -> Option<Step>
where
    F: FnMut(Step) -> Option<Step>,
{
    let mut step = updater(root?)?;

    step.body = match step.body {
        StepBody::Router { settings, children } => StepBody::Router {
            settings,
            children: children
                .into_iter()
                .map(|child| transform(child, &mut *updater))
                .collect(),
        },
        StepBody::Branch { settings, on_success_action, on_failure_action } => StepBody::Branch {
            settings,
            on_success_action: transform_boxed(on_success_action, updater),
            on_failure_action: transform_boxed(on_failure_action, updater),
        },
        StepBody::LoopOnItems { settings, first_loop_action } => StepBody::LoopOnItems {
            settings,
            first_loop_action: transform_boxed(first_loop_action, updater),
        },
        body @ (StepBody::Empty { .. }
        | StepBody::Code { .. }
        | StepBody::Piece { .. }
        | StepBody::PieceTrigger { .. }
        | StepBody::Webhook { .. }
        | StepBody::Missing { .. }
        | StepBody::Unknown { .. }) => body,
    };

    step.next_action = transform_boxed(step.next_action.take(), updater);
    Some(step)
}

fn transform_boxed<F>(root: Option<Box<Step>>, updater: &mut F) -> Option<Box<Step>>
where
    F: FnMut(Step) -> Option<Step>,
{
    transform(root.map(|step| *step), updater).map(Box::new)
}

/// Read-only walk in the same order as [`traverse`]
pub fn visit<'a, F>(root: Option<&'a Step>, visitor: &mut F)
where
    F: FnMut(&'a Step),
{
    let Some(step) = root else {
        return;
    };

    visitor(step);

    match &step.body {
        StepBody::Router { children, .. } => {
            for child in children {
                visit(child.as_ref(), visitor);
            }
        }
        StepBody::Branch { on_success_action, on_failure_action, .. } => {
            visit(on_success_action.as_deref(), visitor);
            visit(on_failure_action.as_deref(), visitor);
        }
        StepBody::LoopOnItems { first_loop_action, .. } => {
            visit(first_loop_action.as_deref(), visitor);
        }
        StepBody::Empty { .. }
        | StepBody::Code { .. }
        | StepBody::Piece { .. }
        | StepBody::PieceTrigger { .. }
        | StepBody::Webhook { .. }
        | StepBody::Missing { .. }
        | StepBody::Unknown { .. } => {}
    }

    visit(step.next_action.as_deref(), visitor);
}

/// All steps of the tree in traversal order
pub fn all_steps(root: Option<&Step>) -> Vec<&Step> {
    let mut steps = Vec::new();
    visit(root, &mut |step| steps.push(step));
    steps
}
