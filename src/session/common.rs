// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Outcome of one state step: move on, stay for another round, or finish.
pub enum Transition<S, R> {
    Next(S, R),
    Stay(R),
    Done(R),
}

pub trait StateMachine<Ctx, StepOut>: Sized {
    type StepResult<'a>: Future<Output = StepOut> + Send + 'a
    where
        Self: 'a,
        Ctx: 'a;

    fn step<'a>(&'a mut self, ctx: &'a mut Ctx) -> Self::StepResult<'a>;
}

/// Drives a tagged-state context to completion. Implementations loop over
/// `step` calls and react to the cancellation token between (or inside)
/// steps; a cancelled context must abandon any pending I/O silently.
pub trait StateMachineCtx<Resp> {
    async fn execute(&mut self, cancel: &CancellationToken) -> Result<Resp>;
}
