//! Per resource access bookkeeping.
//!
//! Every tracked subresource (a buffer, a single mip level and array layer of an image, an acceleration structure) has
//! an [AccessRecord] that describes the last access to it. [track_use] compares a new access against that record and
//! reports a [Hazard] whenever a barrier or a cross-queue dependency is needed.

use ahash::AHashMap;
use marpii_native::{SubresourceRange, ash::vk};

use super::res_states::{AsKey, BufferKey, ImageKey};

///Tracked unit of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum SubKey {
    Buffer(BufferKey),
    Image { key: ImageKey, mip: u32, layer: u32 },
    AccelerationStructure(AsKey),
}

///How a command uses a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    ///Ignored for everything but images.
    pub layout: vk::ImageLayout,
}

impl Access {
    const WRITE_MASK: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
        vk::AccessFlags2::SHADER_WRITE.as_raw()
            | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
            | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
            | vk::AccessFlags2::HOST_WRITE.as_raw()
            | vk::AccessFlags2::MEMORY_WRITE.as_raw()
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
    );

    pub fn new(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        Access {
            stage,
            access,
            layout,
        }
    }

    ///Access without image layout.
    pub fn memory(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self::new(stage, access, vk::ImageLayout::UNDEFINED)
    }

    pub fn is_write(&self) -> bool {
        self.access.intersects(Self::WRITE_MASK)
    }

    ///Union of two accesses of the same command. Conflicting layouts fall back to `GENERAL`.
    pub fn merge(self, other: Access) -> Access {
        let layout = if self.layout == other.layout {
            self.layout
        } else if self.layout == vk::ImageLayout::UNDEFINED {
            other.layout
        } else if other.layout == vk::ImageLayout::UNDEFINED {
            self.layout
        } else {
            vk::ImageLayout::GENERAL
        };
        Access {
            stage: self.stage | other.stage,
            access: self.access | other.access,
            layout,
        }
    }
}

///Last known access of a subresource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccessRecord {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
    pub queue: u32,
    pub batch: u64,
    ///Index of the command within its queue's log of `batch`.
    pub command: usize,
}

impl AccessRecord {
    pub fn is_write(&self) -> bool {
        self.access.intersects(Access::WRITE_MASK)
    }

    fn from_access(access: Access, queue: u32, batch: u64, command: usize) -> Self {
        AccessRecord {
            stage: access.stage,
            access: access.access,
            layout: access.layout,
            queue,
            batch,
            command,
        }
    }
}

///Batch local view onto the persistent records. Changes are collected in an overlay and only written back
/// if the batch can be scheduled.
pub(crate) struct AccessTable<'a> {
    base: &'a AHashMap<SubKey, AccessRecord>,
    overlay: AHashMap<SubKey, AccessRecord>,
}

impl<'a> AccessTable<'a> {
    pub(crate) fn new(base: &'a AHashMap<SubKey, AccessRecord>) -> Self {
        AccessTable {
            base,
            overlay: AHashMap::default(),
        }
    }

    pub(crate) fn get(&self, key: &SubKey) -> Option<AccessRecord> {
        self.overlay
            .get(key)
            .or_else(|| self.base.get(key))
            .copied()
    }

    pub(crate) fn set(&mut self, key: SubKey, record: AccessRecord) {
        self.overlay.insert(key, record);
    }

    pub(crate) fn into_changes(self) -> AHashMap<SubKey, AccessRecord> {
        self.overlay
    }
}

///Reason a barrier, and possibly a dependency, is needed before a new access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Hazard {
    ///None if the resource has not been used before.
    pub(crate) prev: Option<AccessRecord>,
    pub(crate) next: Access,
}

impl Hazard {
    pub(crate) fn is_cross_queue(&self, queue: u32) -> bool {
        self.prev.map(|p| p.queue != queue).unwrap_or(false)
    }

    ///First synchronisation scope of a barrier resolving this hazard on the same queue.
    pub(crate) fn src_scope(&self) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        match self.prev {
            Some(p) => (p.stage, p.access),
            None => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
        }
    }

    pub(crate) fn old_layout(&self) -> vk::ImageLayout {
        self.prev
            .map(|p| p.layout)
            .unwrap_or(vk::ImageLayout::UNDEFINED)
    }

    pub(crate) fn is_layout_change(&self) -> bool {
        self.old_layout() != self.next.layout
    }
}

///Tracks `next` on `key`, issued by `command` on `queue`. Returns the hazard that has to be resolved before
/// the access can happen, if any. The record is overwritten with the new access afterwards.
///
/// Reads after reads in the same layout stay hazard free as long as the new stages and accesses are already covered
/// by the previous reads. In that case the reads accumulate in the record, so a later writer waits for all of them.
pub(crate) fn track_use(
    table: &mut AccessTable,
    key: SubKey,
    next: Access,
    queue: u32,
    batch: u64,
    command: usize,
) -> Option<Hazard> {
    let record = AccessRecord::from_access(next, queue, batch, command);
    let prev = match table.get(&key) {
        Some(prev) => prev,
        None => {
            table.set(key, record);
            //only images might need an initial layout transition
            return match key {
                SubKey::Image { .. } if next.layout != vk::ImageLayout::UNDEFINED => {
                    Some(Hazard { prev: None, next })
                }
                _ => None,
            };
        }
    };

    if prev.queue != queue {
        table.set(key, record);
        return Some(Hazard {
            prev: Some(prev),
            next,
        });
    }

    let layout_change = prev.layout != next.layout;
    if layout_change || prev.is_write() || (next.is_write() && !prev.access.is_empty()) {
        table.set(key, record);
        return Some(Hazard {
            prev: Some(prev),
            next,
        });
    }

    let covered = prev.stage.contains(next.stage) && prev.access.contains(next.access);
    table.set(
        key,
        AccessRecord {
            stage: prev.stage | next.stage,
            access: prev.access | next.access,
            ..record
        },
    );
    if covered {
        None
    } else {
        Some(Hazard {
            prev: Some(prev),
            next,
        })
    }
}

///Merges per-subresource hazards of a single image into as few ranges as possible. Only subresources with
/// identical hazards are merged. Layers are merged first, then consecutive mip levels with the same layer span.
pub(crate) fn merge_image_hazards(
    aspect: vk::ImageAspectFlags,
    mut hazards: Vec<(u32, u32, Hazard)>,
) -> Vec<(SubresourceRange, Hazard)> {
    hazards.sort_by_key(|(mip, layer, _)| (*mip, *layer));

    //runs of layers per mip
    let mut runs: Vec<(SubresourceRange, Hazard)> = Vec::new();
    for (mip, layer, hazard) in hazards {
        if let Some((range, h)) = runs.last_mut() {
            if range.base_mip == mip
                && range.base_layer + range.layer_count == layer
                && *h == hazard
            {
                range.layer_count += 1;
                continue;
            }
        }
        runs.push((SubresourceRange::single(aspect, mip, layer), hazard));
    }

    let mut merged: Vec<(SubresourceRange, Hazard)> = Vec::new();
    for (range, hazard) in runs {
        //find a range that ends at the mip before and covers the same layers
        let target = merged.iter_mut().find(|(r, h)| {
            r.base_mip + r.mip_count == range.base_mip
                && r.base_layer == range.base_layer
                && r.layer_count == range.layer_count
                && *h == hazard
        });
        match target {
            Some((r, _)) => r.mip_count += 1,
            None => merged.push((range, hazard)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn buffer_key() -> BufferKey {
        let mut map = SlotMap::<BufferKey, ()>::with_key();
        map.insert(())
    }

    fn image_key() -> ImageKey {
        let mut map = SlotMap::<ImageKey, ()>::with_key();
        map.insert(())
    }

    fn transfer_write() -> Access {
        Access::memory(
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        )
    }

    fn compute_read() -> Access {
        Access::memory(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_READ,
        )
    }

    #[test]
    fn fresh_buffer_needs_nothing() {
        let base = AHashMap::default();
        let mut table = AccessTable::new(&base);
        let key = SubKey::Buffer(buffer_key());
        assert!(track_use(&mut table, key, transfer_write(), 0, 0, 0).is_none());
        assert_eq!(table.get(&key).unwrap().command, 0);
    }

    #[test]
    fn read_after_write_same_queue() {
        let base = AHashMap::default();
        let mut table = AccessTable::new(&base);
        let key = SubKey::Buffer(buffer_key());
        track_use(&mut table, key, transfer_write(), 0, 0, 0);
        let hazard = track_use(&mut table, key, compute_read(), 0, 0, 1).unwrap();
        assert!(!hazard.is_cross_queue(0));
        assert_eq!(
            hazard.src_scope(),
            (
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE
            )
        );

        //same read again is covered
        assert!(track_use(&mut table, key, compute_read(), 0, 0, 2).is_none());
        //a new read stage is not
        let vertex_read = Access::memory(
            vk::PipelineStageFlags2::VERTEX_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_READ,
        );
        assert!(track_use(&mut table, key, vertex_read, 0, 0, 3).is_some());
        //reads accumulated, the writer waits for both stages
        let war = track_use(&mut table, key, transfer_write(), 0, 0, 4).unwrap();
        assert_eq!(
            war.src_scope().0,
            vk::PipelineStageFlags2::COMPUTE_SHADER | vk::PipelineStageFlags2::VERTEX_SHADER
        );
    }

    #[test]
    fn other_queue_is_always_a_hazard() {
        let base = AHashMap::default();
        let mut table = AccessTable::new(&base);
        let key = SubKey::Buffer(buffer_key());
        track_use(&mut table, key, compute_read(), 0, 0, 0);
        let hazard = track_use(&mut table, key, compute_read(), 1, 0, 0).unwrap();
        assert!(hazard.is_cross_queue(1));
        assert_eq!(table.get(&key).unwrap().queue, 1);
    }

    #[test]
    fn image_layout_transitions() {
        let base = AHashMap::default();
        let mut table = AccessTable::new(&base);
        let key = SubKey::Image {
            key: image_key(),
            mip: 0,
            layer: 0,
        };
        let attachment = Access::new(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let first = track_use(&mut table, key, attachment, 0, 0, 0).unwrap();
        assert!(first.prev.is_none());
        assert_eq!(first.old_layout(), vk::ImageLayout::UNDEFINED);

        let sampled = Access::new(
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        let second = track_use(&mut table, key, sampled, 0, 0, 1).unwrap();
        assert!(second.is_layout_change());
    }

    #[test]
    fn overlay_leaves_base_untouched() {
        let key = SubKey::Buffer(buffer_key());
        let mut base = AHashMap::default();
        base.insert(
            key,
            AccessRecord {
                stage: vk::PipelineStageFlags2::TRANSFER,
                access: vk::AccessFlags2::TRANSFER_WRITE,
                layout: vk::ImageLayout::UNDEFINED,
                queue: 0,
                batch: 0,
                command: 3,
            },
        );
        let mut table = AccessTable::new(&base);
        assert!(track_use(&mut table, key, compute_read(), 1, 1, 0).is_some());
        let changes = table.into_changes();
        assert_eq!(changes[&key].queue, 1);
        assert_eq!(base[&key].queue, 0);
    }

    #[test]
    fn merge_ranges() {
        let hazard = Hazard {
            prev: None,
            next: Access::new(
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ),
        };
        let other = Hazard {
            next: Access {
                layout: vk::ImageLayout::GENERAL,
                ..hazard.next
            },
            ..hazard
        };

        //2 mips, 3 layers, the last layer of mip 1 differs
        let mut subs = Vec::new();
        for mip in 0..2 {
            for layer in 0..3 {
                let h = if mip == 1 && layer == 2 { other } else { hazard };
                subs.push((mip, layer, h));
            }
        }
        let merged = merge_image_hazards(vk::ImageAspectFlags::COLOR, subs);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].0.layer_count, 3);
        assert_eq!(merged[0].0.mip_count, 1);
        assert_eq!(merged[1].0.base_mip, 1);
        assert_eq!(merged[1].0.layer_count, 2);
        assert_eq!(merged[2].1, other);

        //uniform image collapses into a single range
        let uniform = (0..3)
            .flat_map(|mip| (0..2).map(move |layer| (mip, layer, hazard)))
            .collect::<Vec<_>>();
        let merged = merge_image_hazards(vk::ImageAspectFlags::COLOR, uniform);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].0.mip_count, 3);
        assert_eq!(merged[0].0.layer_count, 2);
    }
}
