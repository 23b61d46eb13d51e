use marpii_native::{NativeDevice, NativeError, ash::vk};

#[derive(Clone, Debug, PartialEq)]
struct TimestampRegion {
    from: u32,
    till: u32,
    is_ended: bool,
    name: String,
}

///Gpu time of a named timer region.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskTiming {
    ///Name the timer was started with.
    pub name: String,
    ///Queue the region was recorded on.
    pub queue: u32,
    ///Timing in nanoseconds between start and end of the region.
    pub timing: f32,
}

impl Default for TaskTiming {
    fn default() -> Self {
        TaskTiming {
            name: String::new(),
            queue: 0,
            timing: 0.0,
        }
    }
}

///Timestamp query pool of one queue within one batch. Each region occupies two consecutive queries.
pub(crate) struct TimestampTable {
    pub(crate) pool: vk::QueryPool,
    queue: u32,
    //ordered by start index
    regions: Vec<TimestampRegion>,
    head: u32,
    capacity: u32,
}

impl TimestampTable {
    pub(crate) fn new(
        device: &dyn NativeDevice,
        queue: u32,
        capacity: u32,
    ) -> Result<Self, NativeError> {
        let pool = device.create_timestamp_pool(capacity)?;
        device.reset_query_pool(pool, 0, capacity);
        Ok(TimestampTable {
            pool,
            queue,
            regions: Vec::new(),
            head: 0,
            capacity,
        })
    }

    ///If there is space for a new region, allocates it, writes the start timestamp and returns its identification index.
    pub(crate) fn start_region(
        &mut self,
        device: &dyn NativeDevice,
        command_list: vk::CommandBuffer,
        name: &str,
    ) -> Option<u32> {
        let index = self.head;
        if self.head + 1 >= self.capacity {
            #[cfg(feature = "logging")]
            log::warn!(
                "Could not allocate timestamp region for {}, all {} queries are in use",
                name,
                self.capacity
            );
            return None;
        }
        self.head += 2;

        self.regions.push(TimestampRegion {
            from: index,
            till: index + 1,
            is_ended: false,
            name: name.to_owned(),
        });
        device.cmd_write_timestamp(
            command_list,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            self.pool,
            index,
        );
        Some(index)
    }

    ///Ends the latest open region called `name`.
    pub(crate) fn end_region(
        &mut self,
        device: &dyn NativeDevice,
        command_list: vk::CommandBuffer,
        name: &str,
    ) {
        match self
            .regions
            .iter_mut()
            .rev()
            .find(|r| !r.is_ended && r.name == name)
        {
            Some(region) => {
                device.cmd_write_timestamp(
                    command_list,
                    vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                    self.pool,
                    region.till,
                );
                region.is_ended = true;
            }
            None => {
                #[cfg(feature = "logging")]
                log::error!("No timestamp region found for {}", name);
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    ///Reads back all finished regions. Regions without results are skipped.
    pub(crate) fn resolve(&self, device: &dyn NativeDevice) -> Vec<TaskTiming> {
        let period = device.timestamp_period();
        let results = match device.timestamp_results(self.pool, self.head) {
            Ok(r) => r,
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("Could not read timestamps: {}", _e);
                return Vec::new();
            }
        };

        self.regions
            .iter()
            .filter(|r| r.is_ended)
            .filter_map(|r| {
                let start = results.get(r.from as usize).copied().flatten()?;
                let end = results.get(r.till as usize).copied().flatten()?;
                Some(TaskTiming {
                    name: r.name.clone(),
                    queue: self.queue,
                    timing: end.saturating_sub(start) as f32 * period,
                })
            })
            .collect()
    }

    pub(crate) fn destroy(self, device: &dyn NativeDevice) {
        device.destroy_query_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marpii_native::{
        desc::SubmitInfo,
        headless::{HandleKind, HeadlessDevice},
    };

    #[test]
    fn regions_resolve_after_completion() {
        let device = HeadlessDevice::with_default_queues();
        let mut table = TimestampTable::new(&device, 0, 4).unwrap();
        let cl = device.begin_command_list(0).unwrap();

        assert_eq!(table.start_region(&device, cl, "outer"), Some(0));
        assert_eq!(table.start_region(&device, cl, "inner"), Some(2));
        //full
        assert_eq!(table.start_region(&device, cl, "overflow"), None);
        table.end_region(&device, cl, "inner");
        table.end_region(&device, cl, "outer");
        device.end_command_list(cl).unwrap();

        //nothing executed yet
        assert!(table.resolve(&device).is_empty());

        device
            .submit(
                0,
                &SubmitInfo {
                    command_lists: &[cl],
                    ..Default::default()
                },
            )
            .unwrap();
        let timings = table.resolve(&device);
        assert_eq!(timings.len(), 2);
        assert_eq!(timings[0].name, "outer");
        assert!(timings[0].timing > timings[1].timing);

        device.free_command_list(0, cl);
        table.destroy(&device);
        assert_eq!(device.live_handles(HandleKind::QueryPool), 0);
        assert!(device.validation_errors().is_empty());
    }
}
