use std::time::Duration;

use marpii_native::{NativeDevice, NativeError, QueueInfo, ash::vk};

use crate::Engine;

///Point on a queue's timeline. Expires once the queue's semaphore reached `target_value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guard {
    pub(crate) queue: u32,
    pub(crate) target_value: u64,
}

impl Guard {
    pub fn queue(&self) -> u32 {
        self.queue
    }

    pub fn wait_value(&self) -> u64 {
        self.target_value
    }

    ///Returns true if the guard was passed on the gpu.
    pub fn is_expired(&self, engine: &Engine) -> bool {
        match engine.tracks.0.get(self.queue as usize) {
            Some(t) => engine
                .device
                .semaphore_value(t.sem)
                .map(|v| v >= self.target_value)
                .unwrap_or(false),
            None => {
                #[cfg(feature = "logging")]
                log::warn!("Queried guard for none existent queue {}.", self.queue);
                false
            }
        }
    }

    ///Blocks until the guard expired or `timeout` passed.
    pub fn wait(&self, engine: &Engine, timeout: Duration) -> Result<(), NativeError> {
        match engine.tracks.0.get(self.queue as usize) {
            Some(t) => engine
                .device
                .wait_semaphores(&[(t.sem, self.target_value)], timeout),
            None => Err(NativeError::NoSuchQueue(self.queue)),
        }
    }
}

///Execution track. A device queue and its timeline.
pub(crate) struct Track {
    pub(crate) queue: u32,
    pub(crate) family: u32,
    pub(crate) flags: vk::QueueFlags,
    pub(crate) sem: vk::Semaphore,
    ///Latest value that is going to be signaled eventually.
    pub(crate) latest_signaled_value: u64,
    ///Latest value that is known to be reached on the gpu.
    pub(crate) retired_value: u64,
}

impl Track {
    pub(crate) fn new(
        device: &dyn NativeDevice,
        queue: u32,
        info: &QueueInfo,
    ) -> Result<Self, NativeError> {
        Ok(Track {
            queue,
            family: info.family,
            flags: info.flags,
            sem: device.create_timeline_semaphore(0)?,
            latest_signaled_value: 0,
            retired_value: 0,
        })
    }

    ///Reads back the semaphore value.
    pub(crate) fn poll(&mut self, device: &dyn NativeDevice) -> Result<u64, NativeError> {
        let value = device.semaphore_value(self.sem)?;
        self.retired_value = self.retired_value.max(value);
        Ok(self.retired_value)
    }
}

pub(crate) struct Tracks(pub Vec<Track>);

impl Tracks {
    ///Queue capability precedence, from less important to most important.
    const CAP_PRECEDENCE: &'static [vk::QueueFlags] = &[
        vk::QueueFlags::empty(),
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::COMPUTE,
        vk::QueueFlags::from_raw(
            vk::QueueFlags::TRANSFER.as_raw() | vk::QueueFlags::COMPUTE.as_raw(),
        ),
        vk::QueueFlags::GRAPHICS,
        vk::QueueFlags::from_raw(
            vk::QueueFlags::GRAPHICS.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
        ),
        vk::QueueFlags::from_raw(
            vk::QueueFlags::GRAPHICS.as_raw() | vk::QueueFlags::COMPUTE.as_raw(),
        ),
        vk::QueueFlags::from_raw(
            vk::QueueFlags::GRAPHICS.as_raw()
                | vk::QueueFlags::COMPUTE.as_raw()
                | vk::QueueFlags::TRANSFER.as_raw(),
        ),
    ];

    const CAP_MASK: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::PROTECTED.as_raw()
            | vk::QueueFlags::SPARSE_BINDING.as_raw()
            | vk::QueueFlags::VIDEO_DECODE_KHR.as_raw()
            | vk::QueueFlags::VIDEO_ENCODE_KHR.as_raw(),
    );

    pub(crate) fn new(device: &dyn NativeDevice) -> Result<Self, NativeError> {
        let tracks = device
            .queues()
            .iter()
            .enumerate()
            .map(|(idx, info)| Track::new(device, idx as u32, info))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Tracks(tracks))
    }

    ///Returns the queue that fits `usage` best. A queue that has exactly the requested capabilities
    /// wins, otherwise capabilities are added from less to more important. So a TRANSFER only usage ends up on a
    /// pure transfer queue if there is one.
    pub(crate) fn track_for_usage(&self, usage: vk::QueueFlags) -> Option<u32> {
        for add_on_cap in Self::CAP_PRECEDENCE.iter() {
            let target_usage = usage | *add_on_cap;

            for track in self.0.iter() {
                let masked = track.flags.as_raw() & !Self::CAP_MASK.as_raw();
                if masked == target_usage.as_raw() {
                    #[cfg(feature = "logging")]
                    log::trace!("Using queue {} for {:?}", track.queue, usage);
                    return Some(track.queue);
                }
            }
        }

        #[cfg(feature = "logging")]
        log::error!(
            "Could not find queue for usage {:?}. Loaded queues: {:?}",
            usage,
            self.0.iter().map(|t| t.flags).collect::<Vec<_>>()
        );
        None
    }

    pub(crate) fn destroy(&mut self, device: &dyn NativeDevice) {
        for track in self.0.drain(..) {
            device.destroy_semaphore(track.sem);
        }
    }
}
