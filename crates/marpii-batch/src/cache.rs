//! Deduplicates native objects that are derived from descriptions: descriptor set layouts, pipeline layouts
//! and pipelines. Entries live until the engine is dropped.

use ahash::AHashMap;
use marpii_native::{
    NativeDevice, NativeError,
    ash::vk,
    desc::{DescriptorBinding, PipelineDesc},
};
use smallvec::SmallVec;

type LayoutKey = (SmallVec<[vk::DescriptorSetLayout; 4]>, u32);

#[derive(Default)]
pub struct ContextCache {
    set_layouts: AHashMap<Vec<DescriptorBinding>, vk::DescriptorSetLayout>,
    pipeline_layouts: AHashMap<LayoutKey, vk::PipelineLayout>,
    pipelines: AHashMap<(PipelineDesc, vk::PipelineLayout), vk::Pipeline>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    ///Returns the layout for `bindings`. The order of `bindings` does not matter.
    pub fn get_or_create_set_layout(
        &mut self,
        device: &dyn NativeDevice,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout, NativeError> {
        let mut key = bindings.to_vec();
        key.sort_by_key(|b| b.binding);

        if let Some(layout) = self.set_layouts.get(&key) {
            return Ok(*layout);
        }
        let layout = device.create_descriptor_set_layout(&key)?;

        #[cfg(feature = "logging")]
        log::trace!("Cached descriptor set layout with {} bindings", key.len());

        self.set_layouts.insert(key, layout);
        Ok(layout)
    }

    pub fn get_or_create_pipeline_layout(
        &mut self,
        device: &dyn NativeDevice,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
    ) -> Result<vk::PipelineLayout, NativeError> {
        let key = (set_layouts.iter().copied().collect(), push_constant_size);
        if let Some(layout) = self.pipeline_layouts.get(&key) {
            return Ok(*layout);
        }
        let layout = device.create_pipeline_layout(set_layouts, push_constant_size)?;
        self.pipeline_layouts.insert(key, layout);
        Ok(layout)
    }

    pub fn get_or_create_pipeline(
        &mut self,
        device: &dyn NativeDevice,
        desc: &PipelineDesc,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline, NativeError> {
        let key = (desc.clone(), layout);
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Ok(*pipeline);
        }
        let pipeline = device.create_pipeline(desc, layout)?;

        #[cfg(feature = "logging")]
        log::trace!("Cached {:?} pipeline", desc.bind_point());

        self.pipelines.insert(key, pipeline);
        Ok(pipeline)
    }

    pub fn set_layout_count(&self) -> usize {
        self.set_layouts.len()
    }

    pub fn pipeline_layout_count(&self) -> usize {
        self.pipeline_layouts.len()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    ///Destroys every cached object. Pipelines go first, since they reference their layouts.
    pub(crate) fn destroy(&mut self, device: &dyn NativeDevice) {
        for (_, pipeline) in self.pipelines.drain() {
            device.destroy_pipeline(pipeline);
        }
        for (_, layout) in self.pipeline_layouts.drain() {
            device.destroy_pipeline_layout(layout);
        }
        for (_, layout) in self.set_layouts.drain() {
            device.destroy_descriptor_set_layout(layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marpii_native::headless::{HandleKind, HeadlessDevice};

    fn binding(binding: u32, ty: vk::DescriptorType) -> DescriptorBinding {
        DescriptorBinding {
            binding,
            ty,
            count: 1,
            stages: vk::ShaderStageFlags::COMPUTE,
        }
    }

    #[test]
    fn objects_are_created_once() {
        let device = HeadlessDevice::with_default_queues();
        let mut cache = ContextCache::new();

        let a = cache
            .get_or_create_set_layout(
                &device,
                &[
                    binding(0, vk::DescriptorType::STORAGE_BUFFER),
                    binding(1, vk::DescriptorType::STORAGE_IMAGE),
                ],
            )
            .unwrap();
        //same bindings in different order
        let b = cache
            .get_or_create_set_layout(
                &device,
                &[
                    binding(1, vk::DescriptorType::STORAGE_IMAGE),
                    binding(0, vk::DescriptorType::STORAGE_BUFFER),
                ],
            )
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.set_layout_count(), 1);

        let layout = cache
            .get_or_create_pipeline_layout(&device, &[a], 16)
            .unwrap();
        assert_eq!(
            layout,
            cache
                .get_or_create_pipeline_layout(&device, &[a], 16)
                .unwrap()
        );
        //push constant size is part of the key
        assert_ne!(
            layout,
            cache
                .get_or_create_pipeline_layout(&device, &[a], 0)
                .unwrap()
        );

        let desc = PipelineDesc::Compute {
            shader: vk::ShaderModule::null(),
        };
        let p0 = cache.get_or_create_pipeline(&device, &desc, layout).unwrap();
        let p1 = cache.get_or_create_pipeline(&device, &desc, layout).unwrap();
        assert_eq!(p0, p1);
        assert_eq!(cache.pipeline_count(), 1);
        assert_eq!(device.live_handles(HandleKind::Pipeline), 1);

        cache.destroy(&device);
        assert_eq!(device.live_handles(HandleKind::Pipeline), 0);
        assert_eq!(device.live_handles(HandleKind::PipelineLayout), 0);
        assert_eq!(device.live_handles(HandleKind::DescriptorSetLayout), 0);
        assert!(device.validation_errors().is_empty());
    }
}
