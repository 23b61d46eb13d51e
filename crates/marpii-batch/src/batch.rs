//! # Batch
//!
//! A batch is everything recorded on all queues between two [execute_all](crate::Engine::execute_all) calls.
//! It is handled in three passes:
//!
//! 1. pseudo pass: all command logs are walked in global submission order, without touching the device. Every
//!    resource access is checked against the previous one. Barriers and cross-queue dependencies are derived.
//! 2. resolution: release sites get timeline values, dependency requests become a minimal set of waits.
//! 3. execution: the walk of the pseudo pass is replayed while recording and submitting native commands.
//!
//! Only after a successful pseudo pass the access records of the engine are updated.

mod exec;
mod pseudo;
mod resolve;

use ahash::AHashMap;
use marpii_native::{NativeDevice, desc::BufDesc};
use smallvec::SmallVec;
use thiserror::Error;

pub(crate) use exec::QueueContext;
use pseudo::{QueuePseudoContext, TlasInputs};
use resolve::{ReleaseSite, Resolution, ResolveQueue, resolve};

use crate::{
    BatchError, Guard,
    cache::ContextCache,
    command::{Command, CommandLog},
    resources::{
        Resources,
        access::{AccessRecord, SubKey},
        res_states::{DependencyKey, ReleasePoint, SwapchainKey},
        swapchain::SwapchainState,
    },
    track::Tracks,
};

///Acquire that can never be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedAcquire {
    pub queue: u32,
    ///Index of the acquire in the queue's recorded commands.
    pub command: usize,
    pub token: DependencyKey,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("Dependency cycle: {} queues wait for tokens that are never released", blocked.len())]
    DependencyCycle { blocked: Vec<BlockedAcquire> },
}

///Statistics of a single queue in one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: u32,
    ///Recorded commands.
    pub commands: usize,
    ///Commands visited by the pseudo pass.
    pub pseudo_visits: usize,
    ///Commands replayed by the execution pass.
    pub executed: usize,
    pub submissions: usize,
    pub barriers: usize,
    pub waits: usize,
    pub signals: usize,
    ///Timeline value the queue had promised before the batch.
    pub begin_value: u64,
    ///Timeline value signaled when the queue finished the batch.
    pub end_value: u64,
}

impl QueueStats {
    ///Guard that expires once this queue finished the batch.
    pub fn guard(&self) -> Guard {
        Guard {
            queue: self.queue,
            target_value: self.end_value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub id: u64,
    pub queues: Vec<QueueStats>,
}

impl BatchStats {
    ///True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.commands == 0)
    }
}

pub(crate) struct BatchContext {
    pub(crate) id: u64,
    pub(crate) logs: Vec<CommandLog>,
    pub(crate) pseudo: Vec<QueuePseudoContext>,
    pub(crate) queues: Vec<QueueContext>,
    ///(queue, command) in the order the pseudo pass visited them.
    pub(crate) order: Vec<(u32, usize)>,
    ///Access records changed by this batch. Committed after a successful pseudo pass.
    pub(crate) changes: AHashMap<SubKey, AccessRecord>,
    ///Tokens released in this batch, with queue and command of the release.
    pub(crate) released: Vec<(DependencyKey, u32, usize)>,
    pub(crate) resolution: Resolution,
    ///End values of batches that are still in flight.
    pub(crate) prior_ends: Vec<(u64, SmallVec<[u64; 4]>)>,
    ///Presented swapchains, and whether they reported being suboptimal.
    pub(crate) presented: Vec<(SwapchainKey, bool)>,
    ///Inputs of top level structures as of the command the pseudo pass visits. Committed together with the
    /// access records.
    pub(crate) tlas_inputs: TlasInputs,
}

impl BatchContext {
    ///Takes over the recorded `logs`. Allocates the scratch memory of acceleration structure builds as transient
    /// buffers of batch `id`.
    pub(crate) fn new(
        id: u64,
        logs: Vec<CommandLog>,
        device: &dyn NativeDevice,
        res: &mut Resources,
        tracks: &Tracks,
        prior_ends: Vec<(u64, SmallVec<[u64; 4]>)>,
    ) -> Result<Self, BatchError> {
        let mut pseudo = Vec::with_capacity(logs.len());
        let mut queues = Vec::with_capacity(logs.len());
        for (q, log) in logs.iter().enumerate() {
            let track = &tracks.0[q];
            let mut ctx = QueuePseudoContext::new(q as u32, track.family, log.len());
            for (idx, cmd) in log.commands.iter().enumerate() {
                let scratch_size = match &cmd.command {
                    Command::BuildBlas { blas, .. } => res
                        .acceleration_structures
                        .get(blas.key())
                        .map(|a| a.desc.build_scratch_size),
                    Command::BuildTlas { tlas, .. } => res
                        .acceleration_structures
                        .get(tlas.key())
                        .map(|a| a.desc.build_scratch_size),
                    _ => None,
                };
                if let Some(size) = scratch_size {
                    let scratch = res.add_buffer(device, &BufDesc::storage(size.max(1)), Some(id))?;
                    res.mark_use(scratch.key().into(), id);
                    ctx.ops[idx].scratch = Some(scratch);
                }
            }
            pseudo.push(ctx);
            queues.push(QueueContext::new(q as u32, track.sem));
        }

        Ok(BatchContext {
            id,
            logs,
            pseudo,
            queues,
            order: Vec::new(),
            changes: AHashMap::default(),
            released: Vec::new(),
            resolution: Resolution::default(),
            prior_ends,
            presented: Vec::new(),
            tlas_inputs: TlasInputs::default(),
        })
    }

    ///End value of `batch` on `queue`, if that batch is still in flight.
    pub(crate) fn prior_end(&self, batch: u64, queue: u32) -> Option<u64> {
        self.prior_ends
            .iter()
            .find(|(id, _)| *id == batch)
            .and_then(|(_, ends)| ends.get(queue as usize).copied())
    }

    ///Assigns timeline values to all release sites and writes the resulting waits into the command annotations.
    pub(crate) fn resolve(&mut self, tracks: &Tracks) {
        let resolution = {
            let input = self
                .pseudo
                .iter()
                .zip(tracks.0.iter())
                .map(|(p, track)| ResolveQueue {
                    latest: track.latest_signaled_value,
                    retired: track.retired_value,
                    own_sites: &p.own_sites,
                    requests: &p.requests,
                })
                .collect::<Vec<_>>();
            resolve(&input)
        };

        for (ctx, qr) in self.pseudo.iter_mut().zip(resolution.queues.iter()) {
            for (site, value) in &qr.sites {
                match site {
                    ReleaseSite::Prologue => ctx.prologue_signal = Some(*value),
                    ReleaseSite::After(cmd) => ctx.ops[*cmd].signal = Some(*value),
                }
            }
            for (cmd, wait) in &qr.waits {
                ctx.ops[*cmd].waits.push(*wait);
            }
        }
        self.resolution = resolution;
    }

    ///Writes the outcome of the pseudo pass and the resolution back into the engine state.
    pub(crate) fn commit(&mut self, res: &mut Resources, tracks: &mut Tracks) {
        res.states.extend(self.changes.drain());
        for (tlas, blas) in self.tlas_inputs.drain() {
            if let Some(acc) = res.acceleration_structures.get_mut(tlas) {
                acc.built_from = blas;
            }
        }

        for (token, queue, command) in &self.released {
            let Some(value) = self.resolution.queues[*queue as usize]
                .site_value(ReleaseSite::After(*command))
            else {
                continue;
            };
            if let Some(dep) = res.dependencies.get_mut(*token) {
                dep.release = Some(ReleasePoint {
                    queue: *queue,
                    value,
                    batch: self.id,
                });
            }
        }

        for (track, qr) in tracks.0.iter_mut().zip(self.resolution.queues.iter()) {
            track.latest_signaled_value = qr.end;
        }
    }

    ///Marks presented swapchains as consumed. They have to be acquired again.
    pub(crate) fn finalize(&mut self, res: &mut Resources) {
        for (key, suboptimal) in self.presented.drain(..) {
            if let Some(sc) = res.swapchains.get_mut(key) {
                sc.state = SwapchainState::Idle;
                sc.needs_recreation |= suboptimal;
            }
        }
    }

    ///Runs all three passes.
    pub(crate) fn run(
        &mut self,
        device: &dyn NativeDevice,
        res: &mut Resources,
        cache: &mut ContextCache,
        tracks: &mut Tracks,
        timestamp_capacity: u32,
    ) -> Result<(), BatchError> {
        self.pseudo_execute(res, tracks)?;
        self.resolve(tracks);
        self.commit(res, tracks);
        self.execute(device, res, cache, tracks, timestamp_capacity)?;
        self.finalize(res);
        Ok(())
    }

    pub(crate) fn stats(&self) -> BatchStats {
        BatchStats {
            id: self.id,
            queues: self
                .queues
                .iter()
                .enumerate()
                .map(|(q, qc)| {
                    let resolution = self.resolution.queues.get(q).cloned().unwrap_or_default();
                    QueueStats {
                        queue: q as u32,
                        commands: self.logs[q].len(),
                        pseudo_visits: self.pseudo[q].visits,
                        begin_value: resolution.begin,
                        end_value: resolution.end,
                        ..qc.stats.clone()
                    }
                })
                .collect(),
        }
    }

    ///End value of every queue.
    pub(crate) fn ends(&self) -> SmallVec<[u64; 4]> {
        self.resolution.queues.iter().map(|q| q.end).collect()
    }
}
