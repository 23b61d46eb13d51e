//! Turns the dependency requests of the pseudo pass into timeline values.
//!
//! Requests that are already implied by an earlier request of the same queue are dropped first. Every queue then
//! gets one strictly increasing value per remaining release site, starting after the latest value the queue
//! already promised, and the requests become waits on those values. The whole step is a pure function of its
//! input.

use marpii_native::ash::vk;

///Point in a queue's stream that signals a timeline value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum ReleaseSite {
    ///Before any command of the batch. Carries ownership releases of resources last used in an earlier batch.
    Prologue,
    ///After the command with this index.
    After(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum DepSource {
    ///A site that is signaled within this batch.
    Site { queue: u32, site: ReleaseSite },
    ///An already known value, signaled by an earlier batch.
    Value { queue: u32, value: u64 },
}

///Command `dst_cmd` of the requesting queue has to wait for `src`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct DepRequest {
    pub(crate) dst_cmd: usize,
    pub(crate) src: DepSource,
}

///Wait for `queue`'s timeline to reach `value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Wait {
    pub queue: u32,
    pub value: u64,
}

///Per queue input of [resolve].
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolveQueue<'a> {
    ///Latest value that was promised on this queue so far.
    pub(crate) latest: u64,
    ///Latest value known to be reached.
    pub(crate) retired: u64,
    ///Sites this queue needs regardless of requests, like token releases.
    pub(crate) own_sites: &'a [ReleaseSite],
    pub(crate) requests: &'a [DepRequest],
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct QueueResolution {
    ///Value the queue had reached before this batch.
    pub(crate) begin: u64,
    ///Value signaled once the whole batch finished on this queue.
    pub(crate) end: u64,
    ///Sorted by site.
    pub(crate) sites: Vec<(ReleaseSite, u64)>,
    ///Sorted by command.
    pub(crate) waits: Vec<(usize, Wait)>,
}

impl QueueResolution {
    pub(crate) fn site_value(&self, site: ReleaseSite) -> Option<u64> {
        self.sites
            .binary_search_by_key(&site, |(s, _)| *s)
            .ok()
            .map(|idx| self.sites[idx].1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct Resolution {
    pub(crate) queues: Vec<QueueResolution>,
}

///Position of a request's source on its queue's timeline. Values of earlier batches always come before the sites
/// of the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Point {
    Value(u64),
    Site(ReleaseSite),
}

///Requests of queue `dst` that are not implied by another one, as `(command, source queue, point)`.
fn required_requests(input: &[ResolveQueue], dst: usize) -> Vec<(usize, u32, Point)> {
    let mut requests = input[dst]
        .requests
        .iter()
        .filter_map(|req| {
            let (queue, point) = match req.src {
                DepSource::Site { queue, site } => (queue, Point::Site(site)),
                DepSource::Value { queue, value } => (queue, Point::Value(value)),
            };
            let src = input.get(queue as usize)?;
            let reached = matches!(point, Point::Value(value) if value <= src.retired);
            if queue as usize == dst || reached {
                None
            } else {
                Some((req.dst_cmd, queue, point))
            }
        })
        .collect::<Vec<_>>();

    //latest point first, so earlier points on the same command are implied
    requests.sort_by(|(ca, qa, pa), (cb, qb, pb)| ca.cmp(cb).then(qa.cmp(qb)).then(pb.cmp(pa)));

    let mut waited: Vec<Option<Point>> = vec![None; input.len()];
    requests.retain(|(_cmd, queue, point)| {
        let max = &mut waited[*queue as usize];
        if max.map(|max| *point <= max).unwrap_or(false) {
            false
        } else {
            *max = Some(*point);
            true
        }
    });
    requests
}

pub(crate) fn resolve(input: &[ResolveQueue]) -> Resolution {
    //pruned before allocation, a site without a waiter gets no value
    let required = (0..input.len())
        .map(|dst| required_requests(input, dst))
        .collect::<Vec<_>>();

    let mut sites: Vec<Vec<ReleaseSite>> = input.iter().map(|q| q.own_sites.to_vec()).collect();
    for (_cmd, queue, point) in required.iter().flatten() {
        if let Point::Site(site) = point {
            sites[*queue as usize].push(*site);
        }
    }

    let mut queues = input
        .iter()
        .zip(sites)
        .map(|(q, mut sites)| {
            sites.sort();
            sites.dedup();
            let mut value = q.latest;
            let sites = sites
                .into_iter()
                .map(|site| {
                    value += 1;
                    (site, value)
                })
                .collect::<Vec<_>>();
            QueueResolution {
                begin: q.latest,
                end: value + 1,
                sites,
                waits: Vec::new(),
            }
        })
        .collect::<Vec<_>>();

    for (dst, requests) in required.into_iter().enumerate() {
        let waits: Vec<(usize, Wait)> = requests
            .into_iter()
            .filter_map(|(cmd, queue, point)| {
                let value = match point {
                    Point::Site(site) => queues[queue as usize].site_value(site)?,
                    Point::Value(value) => value,
                };
                Some((cmd, Wait { queue, value }))
            })
            .collect();
        queues[dst].waits = waits;
    }

    Resolution { queues }
}

///Stage the semaphore waits of the execution pass block.
pub(crate) const WAIT_STAGE: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::ALL_COMMANDS;

#[cfg(test)]
mod tests {
    use super::*;

    fn site(queue: u32, site: ReleaseSite, dst_cmd: usize) -> DepRequest {
        DepRequest {
            dst_cmd,
            src: DepSource::Site { queue, site },
        }
    }

    #[test]
    fn values_follow_latest() {
        let q0_requests = [];
        let q1_requests = [
            site(0, ReleaseSite::After(3), 1),
            site(0, ReleaseSite::After(1), 0),
        ];
        let input = [
            ResolveQueue {
                latest: 10,
                retired: 10,
                own_sites: &[ReleaseSite::After(5)],
                requests: &q0_requests,
            },
            ResolveQueue {
                latest: 4,
                retired: 2,
                own_sites: &[],
                requests: &q1_requests,
            },
        ];
        let res = resolve(&input);
        assert_eq!(
            res.queues[0].sites,
            vec![
                (ReleaseSite::After(1), 11),
                (ReleaseSite::After(3), 12),
                (ReleaseSite::After(5), 13)
            ]
        );
        assert_eq!(res.queues[0].begin, 10);
        assert_eq!(res.queues[0].end, 14);
        assert_eq!(res.queues[1].end, 5);
        assert_eq!(
            res.queues[1].waits,
            vec![
                (0, Wait { queue: 0, value: 11 }),
                (1, Wait { queue: 0, value: 12 })
            ]
        );
    }

    #[test]
    fn implied_and_retired_waits_are_dropped() {
        let q1_requests = [
            site(0, ReleaseSite::After(4), 0),
            //implied by the wait of command 0
            site(0, ReleaseSite::After(2), 3),
            //same command, lower value
            site(0, ReleaseSite::Prologue, 0),
            //already reached
            DepRequest {
                dst_cmd: 1,
                src: DepSource::Value { queue: 2, value: 7 },
            },
            DepRequest {
                dst_cmd: 2,
                src: DepSource::Value { queue: 2, value: 9 },
            },
        ];
        let input = [
            ResolveQueue {
                latest: 0,
                retired: 0,
                own_sites: &[],
                requests: &[],
            },
            ResolveQueue {
                latest: 0,
                retired: 0,
                own_sites: &[],
                requests: &q1_requests,
            },
            ResolveQueue {
                latest: 9,
                retired: 8,
                own_sites: &[],
                requests: &[],
            },
        ];
        let res = resolve(&input);
        //only the site that is still waited on gets a value
        assert_eq!(res.queues[0].sites, vec![(ReleaseSite::After(4), 1)]);
        assert_eq!(res.queues[0].site_value(ReleaseSite::Prologue), None);
        assert_eq!(res.queues[0].end, 2);
        assert_eq!(
            res.queues[1].waits,
            vec![
                (0, Wait { queue: 0, value: 1 }),
                (2, Wait { queue: 2, value: 9 })
            ]
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let requests = [
            site(1, ReleaseSite::After(0), 2),
            site(1, ReleaseSite::After(0), 5),
        ];
        let other = [site(0, ReleaseSite::After(1), 1)];
        let input = [
            ResolveQueue {
                latest: 3,
                retired: 1,
                own_sites: &[ReleaseSite::After(1)],
                requests: &requests,
            },
            ResolveQueue {
                latest: 7,
                retired: 7,
                own_sites: &[],
                requests: &other,
            },
        ];
        assert_eq!(resolve(&input), resolve(&input));
    }

    #[test]
    fn earlier_batch_values_are_implied_by_sites() {
        let q1_requests = [
            DepRequest {
                dst_cmd: 0,
                src: DepSource::Value { queue: 0, value: 6 },
            },
            site(0, ReleaseSite::Prologue, 0),
            //the prologue wait of command 0 already covers the old value
            DepRequest {
                dst_cmd: 2,
                src: DepSource::Value { queue: 0, value: 5 },
            },
            site(0, ReleaseSite::After(3), 4),
        ];
        let input = [
            ResolveQueue {
                latest: 6,
                retired: 4,
                own_sites: &[],
                requests: &[],
            },
            ResolveQueue {
                latest: 2,
                retired: 2,
                own_sites: &[],
                requests: &q1_requests,
            },
        ];
        let res = resolve(&input);
        assert_eq!(
            res.queues[0].sites,
            vec![(ReleaseSite::Prologue, 7), (ReleaseSite::After(3), 8)]
        );
        assert_eq!(
            res.queues[1].waits,
            vec![
                (0, Wait { queue: 0, value: 7 }),
                (4, Wait { queue: 0, value: 8 })
            ]
        );
    }
}
