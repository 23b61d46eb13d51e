use marpii_native::{
    SubresourceRange,
    ash::vk,
    desc::{BufferCopyRegion, BufferImageCopyRegion, PipelineDesc},
};
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    Engine,
    command::{
        Attachment, AttachmentTarget, BoundResource, Command, DrawCall, IndexBuffer, PassAttachment,
        PassDesc, RecordedCommand, ShaderInput, VertexBuffer,
    },
    resources::{
        handle::{
            BlasHandle, BufferHandle, DependencyHandle, ImageHandle, SwapchainHandle, TlasHandle,
        },
        res_states::{AnyResKey, ArrayElement, AsKey, ImageKey},
        swapchain::SwapchainState,
    },
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Queue {0} does not exist")]
    NoSuchQueue(u32),
    #[error("No queue with capabilities {0:?} found")]
    NoFittingQueue(vk::QueueFlags),
    #[error("Queue {queue} does not support {required:?}")]
    UnsupportedOnQueue {
        queue: u32,
        required: vk::QueueFlags,
    },
    #[error("{0} needs an open render pass")]
    PassNotOpen(&'static str),
    #[error("A render pass is already open on this queue")]
    PassAlreadyOpen,
    #[error("{0} can not be recorded inside a render pass")]
    CommandInsidePass(&'static str),
    #[error("Swapchain has no acquired image")]
    SwapchainNotAcquired,
    #[error("Timer {0} was not started")]
    TimerNotStarted(String),
    #[error("Timer {0} is already running")]
    TimerAlreadyStarted(String),
    #[error("Resource {0} does not exist (anymore)")]
    UnknownResource(AnyResKey),
    #[error("Subresources {range:?} are outside of image {image}")]
    SubresourceOutOfRange {
        image: AnyResKey,
        range: SubresourceRange,
    },
}

///Appends commands to one queue's log of the batch that is currently recorded.
///
/// Nothing is executed until [execute_all](Engine::execute_all) is called. Barriers, layout transitions and
/// cross-queue synchronisation are derived from the recorded commands, the recorder only validates that each
/// command makes sense on its own.
pub struct QueueRecorder<'e> {
    pub(crate) engine: &'e mut Engine,
    pub(crate) queue: u32,
}

impl<'e> QueueRecorder<'e> {
    ///Index of the queue this recorder appends to.
    pub fn queue(&self) -> u32 {
        self.queue
    }

    fn flags(&self) -> vk::QueueFlags {
        self.engine.tracks.0[self.queue as usize].flags
    }

    fn require(&self, required: vk::QueueFlags) -> Result<(), RecordError> {
        if self.flags().contains(required) {
            Ok(())
        } else {
            Err(RecordError::UnsupportedOnQueue {
                queue: self.queue,
                required,
            })
        }
    }

    fn require_transfer(&self) -> Result<(), RecordError> {
        let supported = self.flags().intersects(
            vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        );
        if supported {
            Ok(())
        } else {
            Err(RecordError::UnsupportedOnQueue {
                queue: self.queue,
                required: vk::QueueFlags::TRANSFER,
            })
        }
    }

    fn outside_pass(&self, name: &'static str) -> Result<(), RecordError> {
        if self.engine.logs[self.queue as usize].open_pass.is_some() {
            Err(RecordError::CommandInsidePass(name))
        } else {
            Ok(())
        }
    }

    fn push(&mut self, command: Command) -> usize {
        let index = self.engine.next_index;
        self.engine.next_index += 1;

        #[cfg(feature = "logging")]
        log::trace!(
            "Queue {}: record {} with index {}",
            self.queue,
            command.name(),
            index
        );

        let log = &mut self.engine.logs[self.queue as usize];
        log.commands.push(RecordedCommand { index, command });
        log.len() - 1
    }

    fn touch(&mut self, key: impl Into<AnyResKey>) {
        let batch = self.engine.batch_id;
        self.engine.res.mark_use(key.into(), batch);
    }

    fn touch_buffer(&mut self, buffer: &BufferHandle) -> Result<(), RecordError> {
        let key = buffer.key();
        let Some(buf) = self.engine.res.buffers.get(key) else {
            return Err(RecordError::UnknownResource(key.into()));
        };
        if let Some(owner) = buf.transient_batch {
            assert!(
                owner == self.engine.batch_id && !buf.is_expired(),
                "Transient buffer {:?} used outside of the batch it was created for",
                key
            );
        }
        self.touch(key);
        Ok(())
    }

    fn touch_image(&mut self, image: &ImageHandle) -> Result<(), RecordError> {
        if !self.engine.res.images.contains_key(image.key()) {
            return Err(RecordError::UnknownResource(image.key().into()));
        }
        self.touch(image.key());
        Ok(())
    }

    fn touch_acceleration_structure(
        &mut self,
        key: AsKey,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<(), RecordError> {
        let Some(acc) = self.engine.res.acceleration_structures.get(key) else {
            return Err(RecordError::UnknownResource(key.into()));
        };
        assert_eq!(
            acc.desc.ty, ty,
            "Acceleration structure {:?} used with the wrong level",
            key
        );
        let blas = acc
            .built_from
            .iter()
            .map(|b| b.key())
            .collect::<SmallVec<[AsKey; 4]>>();
        self.touch(key);
        for b in blas {
            self.touch(b);
        }
        Ok(())
    }

    fn touch_shader_input(&mut self, input: &ShaderInput) -> Result<(), RecordError> {
        for binding in &input.bindings {
            match &binding.resource {
                BoundResource::StorageBuffer(b) | BoundResource::UniformBuffer(b) => {
                    self.touch_buffer(b)?
                }
                BoundResource::SampledImage(i) | BoundResource::StorageImage(i) => {
                    self.touch_image(i)?
                }
                BoundResource::Sampler(s) => self.touch(s.key()),
                BoundResource::CombinedImageSampler(i, s) => {
                    self.touch_image(i)?;
                    self.touch(s.key());
                }
                BoundResource::AccelerationStructure(tlas) => self.touch_acceleration_structure(
                    tlas.key(),
                    vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                )?,
                BoundResource::DescriptorArray(array) => {
                    let Some(arr) = self.engine.res.descriptor_arrays.get(array.key()) else {
                        return Err(RecordError::UnknownResource(array.key().into()));
                    };
                    let elements = arr.elements.clone();
                    self.touch(array.key());
                    for element in &elements {
                        match element {
                            ArrayElement::StorageBuffer(b) | ArrayElement::UniformBuffer(b) => {
                                self.touch_buffer(b)?
                            }
                            ArrayElement::SampledImage(i) | ArrayElement::StorageImage(i) => {
                                self.touch_image(i)?
                            }
                            ArrayElement::Sampler(s) => self.touch(s.key()),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    ///Checks that `range` lies within the mip levels and array layers of `image`.
    fn check_range(&self, image: ImageKey, range: SubresourceRange) -> Result<(), RecordError> {
        let Some(img) = self.engine.res.images.get(image) else {
            return Err(RecordError::UnknownResource(image.into()));
        };
        let mips = range.base_mip.checked_add(range.mip_count);
        let layers = range.base_layer.checked_add(range.layer_count);
        if mips.is_some_and(|end| end <= img.desc.mip_levels)
            && layers.is_some_and(|end| end <= img.desc.array_layers)
        {
            Ok(())
        } else {
            Err(RecordError::SubresourceOutOfRange {
                image: image.into(),
                range,
            })
        }
    }

    ///Resolves an attachment to a concrete image and returns its extent.
    fn resolve_attachment(
        &mut self,
        attachment: &Attachment,
    ) -> Result<(PassAttachment, u32, u32), RecordError> {
        let (image, acquire): (ImageKey, Option<vk::Semaphore>) = match &attachment.target {
            AttachmentTarget::Image(img) => {
                self.touch_image(img)?;
                (img.key(), None)
            }
            AttachmentTarget::Swapchain(sc) => {
                let Some(swapchain) = self.engine.res.swapchains.get(sc.key()) else {
                    return Err(RecordError::UnknownResource(sc.key().into()));
                };
                let Some((image, _index, semaphore)) = swapchain.acquired() else {
                    return Err(RecordError::SwapchainNotAcquired);
                };
                self.touch(sc.key());
                self.touch(image);
                (image, Some(semaphore))
            }
        };

        let Some(img) = self.engine.res.images.get(image) else {
            return Err(RecordError::UnknownResource(image.into()));
        };
        let range = SubresourceRange::single(img.desc.aspect(), attachment.mip, attachment.layer);
        self.check_range(image, range)?;
        let width = (img.desc.width >> attachment.mip).max(1);
        let height = (img.desc.height >> attachment.mip).max(1);

        Ok((
            PassAttachment {
                image,
                target: attachment.target.clone(),
                mip: attachment.mip,
                layer: attachment.layer,
                load_op: attachment.load_op,
                store_op: attachment.store_op,
                clear: attachment.clear,
                acquire,
            },
            width,
            height,
        ))
    }

    ///Copies `regions` from `src` to `dst`.
    pub fn copy_buffer(
        &mut self,
        src: &BufferHandle,
        dst: &BufferHandle,
        regions: &[BufferCopyRegion],
    ) -> Result<&mut Self, RecordError> {
        self.require_transfer()?;
        self.outside_pass("CopyBuffer")?;
        self.touch_buffer(src)?;
        self.touch_buffer(dst)?;
        self.push(Command::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            regions: regions.iter().copied().collect(),
        });
        Ok(self)
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &BufferHandle,
        dst: &ImageHandle,
        regions: &[BufferImageCopyRegion],
    ) -> Result<&mut Self, RecordError> {
        self.require_transfer()?;
        self.outside_pass("CopyBufferToImage")?;
        self.touch_buffer(src)?;
        self.touch_image(dst)?;
        for region in regions {
            self.check_range(dst.key(), region.range())?;
        }
        self.push(Command::CopyBufferToImage {
            src: src.clone(),
            dst: dst.clone(),
            regions: regions.iter().copied().collect(),
        });
        Ok(self)
    }

    ///Builds `blas` from a triangle list. The scratch buffer is allocated by the engine.
    pub fn build_blas(
        &mut self,
        blas: &BlasHandle,
        vertices: &BufferHandle,
        vertex_stride: u64,
        vertex_count: u32,
        indices: Option<&BufferHandle>,
        primitive_count: u32,
    ) -> Result<&mut Self, RecordError> {
        self.require(vk::QueueFlags::COMPUTE)?;
        self.outside_pass("BuildBlas")?;
        self.touch_acceleration_structure(
            blas.key(),
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        )?;
        self.touch_buffer(vertices)?;
        if let Some(idx) = indices {
            self.touch_buffer(idx)?;
        }
        self.push(Command::BuildBlas {
            blas: blas.clone(),
            vertices: vertices.clone(),
            vertex_stride,
            vertex_count,
            indices: indices.cloned(),
            primitive_count,
        });
        Ok(self)
    }

    ///Builds `tlas` from an instance buffer that references `blas`.
    pub fn build_tlas(
        &mut self,
        tlas: &TlasHandle,
        instances: &BufferHandle,
        blas: &[BlasHandle],
    ) -> Result<&mut Self, RecordError> {
        self.require(vk::QueueFlags::COMPUTE)?;
        self.outside_pass("BuildTlas")?;
        self.touch_acceleration_structure(
            tlas.key(),
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        )?;
        self.touch_buffer(instances)?;
        for b in blas {
            self.touch_acceleration_structure(
                b.key(),
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            )?;
        }
        self.push(Command::BuildTlas {
            tlas: tlas.clone(),
            instances: instances.clone(),
            blas: blas.iter().cloned().collect(),
        });
        Ok(self)
    }

    ///Starts a render pass. All attachments must have the same extent.
    pub fn begin_pass(
        &mut self,
        color: &[Attachment],
        depth: Option<Attachment>,
    ) -> Result<&mut Self, RecordError> {
        self.require(vk::QueueFlags::GRAPHICS)?;
        if self.engine.logs[self.queue as usize].open_pass.is_some() {
            return Err(RecordError::PassAlreadyOpen);
        }

        let mut extent: Option<(u32, u32)> = None;
        let mut check_extent = |w: u32, h: u32| match extent {
            None => extent = Some((w, h)),
            Some(e) => assert!(
                e == (w, h),
                "Mismatched render target sizes: {}x{} and {}x{}",
                e.0,
                e.1,
                w,
                h
            ),
        };

        let mut resolved_color = SmallVec::new();
        for att in color {
            let (att, w, h) = self.resolve_attachment(att)?;
            check_extent(w, h);
            resolved_color.push(att);
        }
        let resolved_depth = match depth {
            Some(att) => {
                let (att, w, h) = self.resolve_attachment(&att)?;
                check_extent(w, h);
                Some(att)
            }
            None => None,
        };
        let (width, height) = extent.unwrap_or((1, 1));

        let index = self.push(Command::BeginPass(PassDesc {
            color: resolved_color,
            depth: resolved_depth,
            width,
            height,
        }));
        self.engine.logs[self.queue as usize].open_pass = Some((index, width, height));
        Ok(self)
    }

    ///Records a draw within the open pass.
    pub fn draw(&mut self, call: DrawCall) -> Result<&mut Self, RecordError> {
        if self.engine.logs[self.queue as usize].open_pass.is_none() {
            return Err(RecordError::PassNotOpen("Draw"));
        }
        assert!(
            matches!(call.input.pipeline, PipelineDesc::Graphics(_)),
            "Draw needs a graphics pipeline"
        );
        self.touch_shader_input(&call.input)?;
        for vb in &call.vertex_buffers {
            self.touch_buffer(&vb.buffer)?;
        }
        if let Some(ib) = &call.index_buffer {
            self.touch_buffer(&ib.buffer)?;
        }
        self.push(Command::Draw(call));
        Ok(self)
    }

    pub fn draw_instanced(
        &mut self,
        input: ShaderInput,
        vertex_buffers: &[VertexBuffer],
        vertex_count: u32,
        instance_count: u32,
    ) -> Result<&mut Self, RecordError> {
        let mut call = DrawCall::new(input, vertex_count, instance_count);
        call.vertex_buffers = vertex_buffers.iter().cloned().collect();
        self.draw(call)
    }

    pub fn draw_indexed_instanced(
        &mut self,
        input: ShaderInput,
        vertex_buffers: &[VertexBuffer],
        index_buffer: IndexBuffer,
        index_count: u32,
        instance_count: u32,
    ) -> Result<&mut Self, RecordError> {
        let mut call = DrawCall::new(input, index_count, instance_count);
        call.vertex_buffers = vertex_buffers.iter().cloned().collect();
        call.index_buffer = Some(index_buffer);
        self.draw(call)
    }

    pub fn end_pass(&mut self) -> Result<&mut Self, RecordError> {
        if self.engine.logs[self.queue as usize].open_pass.is_none() {
            return Err(RecordError::PassNotOpen("EndPass"));
        }
        self.push(Command::EndPass);
        self.engine.logs[self.queue as usize].open_pass = None;
        Ok(self)
    }

    pub fn dispatch(
        &mut self,
        input: ShaderInput,
        groups: [u32; 3],
    ) -> Result<&mut Self, RecordError> {
        self.require(vk::QueueFlags::COMPUTE)?;
        self.outside_pass("Dispatch")?;
        assert!(
            matches!(input.pipeline, PipelineDesc::Compute { .. }),
            "Dispatch needs a compute pipeline"
        );
        self.touch_shader_input(&input)?;
        self.push(Command::Dispatch { input, groups });
        Ok(self)
    }

    pub fn trace_rays(
        &mut self,
        input: ShaderInput,
        extent: [u32; 3],
    ) -> Result<&mut Self, RecordError> {
        self.require(vk::QueueFlags::COMPUTE)?;
        self.outside_pass("TraceRays")?;
        assert!(
            matches!(input.pipeline, PipelineDesc::RayTracing(_)),
            "TraceRays needs a ray tracing pipeline"
        );
        self.touch_shader_input(&input)?;
        self.push(Command::TraceRays { input, extent });
        Ok(self)
    }

    ///Presents the acquired image of `swapchain`. The swapchain has to be acquired again before it can be
    /// used in the next batch.
    pub fn present(&mut self, swapchain: &SwapchainHandle) -> Result<&mut Self, RecordError> {
        self.outside_pass("Present")?;
        let Some(sc) = self.engine.res.swapchains.get_mut(swapchain.key()) else {
            return Err(RecordError::UnknownResource(swapchain.key().into()));
        };
        let Some((image, index, semaphore)) = sc.acquired() else {
            return Err(RecordError::SwapchainNotAcquired);
        };
        sc.state = SwapchainState::PresentRecorded { index, semaphore };

        self.touch(swapchain.key());
        self.touch(image);
        self.push(Command::Present {
            swapchain: swapchain.clone(),
            image,
            index,
            acquire: semaphore,
        });
        Ok(self)
    }

    ///Releases `token`. Any queue that acquires the token afterwards waits for all work recorded on this
    /// queue so far.
    ///
    /// # Panics
    ///
    /// if the token was already released in this batch.
    pub fn release_dependency(
        &mut self,
        token: &DependencyHandle,
    ) -> Result<&mut Self, RecordError> {
        self.outside_pass("ReleaseDependency")?;
        let batch = self.engine.batch_id;
        let Some(dep) = self.engine.res.dependencies.get_mut(token.key()) else {
            return Err(RecordError::UnknownResource(token.key().into()));
        };
        assert!(
            dep.recorded_release != Some(batch),
            "Dependency token {:?} released twice in one batch",
            token.key()
        );
        dep.recorded_release = Some(batch);
        self.touch(token.key());
        self.push(Command::ReleaseDependency(token.clone()));
        Ok(self)
    }

    ///Waits for the release of `token` before executing any further command on this queue.
    pub fn acquire_dependency(
        &mut self,
        token: &DependencyHandle,
    ) -> Result<&mut Self, RecordError> {
        self.outside_pass("AcquireDependency")?;
        if !self.engine.res.dependencies.contains_key(token.key()) {
            return Err(RecordError::UnknownResource(token.key().into()));
        }
        self.touch(token.key());
        self.push(Command::AcquireDependency(token.clone()));
        Ok(self)
    }

    ///Starts a named GPU timer. The result is available through [timings](Engine::timings) once the batch retired.
    pub fn start_timer(&mut self, name: &str) -> Result<&mut Self, RecordError> {
        let log = &mut self.engine.logs[self.queue as usize];
        if log.open_timers.iter().any(|t| t == name) {
            return Err(RecordError::TimerAlreadyStarted(name.to_owned()));
        }
        log.open_timers.push(name.to_owned());
        self.push(Command::StartTimer(name.to_owned()));
        Ok(self)
    }

    pub fn end_timer(&mut self, name: &str) -> Result<&mut Self, RecordError> {
        let log = &mut self.engine.logs[self.queue as usize];
        match log.open_timers.iter().position(|t| t == name) {
            Some(pos) => {
                log.open_timers.remove(pos);
            }
            None => return Err(RecordError::TimerNotStarted(name.to_owned())),
        }
        self.push(Command::EndTimer(name.to_owned()));
        Ok(self)
    }

    ///Ends the current submission on this queue. Work recorded afterwards is submitted separately.
    pub fn pause(&mut self) -> Result<&mut Self, RecordError> {
        self.outside_pass("Pause")?;
        self.push(Command::Pause);
        Ok(self)
    }
}
