// QAT Sequence Producer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! QAT device and instance discovery.
//!
//! Instances are enumerated once, grouped by the physical device (package)
//! they live on and then interleaved round-robin, so that consecutive pool
//! slots sit on different devices. Instances that cannot produce LZ4S
//! sequences, or that need contiguous memory under the `Reject` policy, are
//! dropped afterwards.

use crate::config::{Config, ContiguousPolicy};
use crate::descriptor::Capabilities;
use crate::driver::{Driver, DriverCall, InstanceHandle, InstanceInfo};
use crate::error::{QatError, QatResult};
use std::collections::{BTreeMap, VecDeque};

/// One enumerated instance with everything the pool needs to know about it.
#[derive(Debug, Clone)]
pub struct DiscoveredInstance {
    pub handle: InstanceHandle,
    pub info: InstanceInfo,
    pub capabilities: Capabilities,
    /// Buffers handed to this instance must be physically contiguous.
    pub requires_contiguous: bool,
}

/// Check that devices exist, then start the user-mode driver.
pub fn start_user(driver: &dyn Driver, config: &Config) -> QatResult<()> {
    let devices = driver.num_devices().during("num_devices")?;
    if devices == 0 {
        log::error!("There is no QAT device available");
        return Err(QatError::NoDeviceFound);
    }
    driver.user_start(&config.section_name).during("user_start")?;
    log::debug!(
        "Started user process for section {} ({} devices)",
        config.section_name,
        devices
    );
    Ok(())
}

/// Enumerate, interleave and filter the driver's compression instances.
///
/// Either returns at least one usable instance or fails.
pub fn discover_instances(
    driver: &dyn Driver,
    config: &Config,
) -> QatResult<Vec<DiscoveredInstance>> {
    let count = driver.num_instances().during("num_instances")?;
    if count == 0 {
        log::error!("No QAT instance found");
        return Err(QatError::NoQualifyingInstance { found: 0 });
    }
    let handles = driver.instances(count).during("instances")?;

    let mut by_device: BTreeMap<u32, VecDeque<DiscoveredInstance>> = BTreeMap::new();
    for handle in handles {
        let info = driver.instance_info(handle).during("instance_info")?;
        if info.package_id >= config.max_devices {
            log::error!(
                "Package id {} of instance {} exceeds {}",
                info.package_id,
                info.instance_id,
                config.max_devices
            );
            return Err(QatError::DeviceIdOutOfRange {
                package_id: info.package_id,
                max: config.max_devices,
            });
        }
        let capabilities = driver
            .query_capabilities(handle)
            .during("query_capabilities")?;
        log::debug!(
            "Instance {} on package {}: {:?}",
            info.instance_id,
            info.package_id,
            capabilities
        );
        by_device
            .entry(info.package_id)
            .or_default()
            .push_back(DiscoveredInstance {
                handle,
                requires_contiguous: info.requires_contiguous,
                info,
                capabilities,
            });
    }

    let found = count as usize;
    let usable: Vec<_> = round_robin(by_device)
        .into_iter()
        .filter(|inst| qualifies(inst, config.contiguous_policy))
        .map(|mut inst| {
            if config.contiguous_policy == ContiguousPolicy::Pinned {
                inst.requires_contiguous = true;
            }
            inst
        })
        .collect();

    if usable.is_empty() {
        log::error!("None of {} instances supports LZ4S sequence production", found);
        return Err(QatError::NoQualifyingInstance { found });
    }
    log::info!("{} of {} QAT instances usable", usable.len(), found);
    Ok(usable)
}

fn qualifies(inst: &DiscoveredInstance, policy: ContiguousPolicy) -> bool {
    if !inst.capabilities.supports_sequence_production() {
        log::debug!(
            "Instance {} lacks LZ4S or XXHash32 support",
            inst.info.instance_id
        );
        return false;
    }
    if inst.requires_contiguous && policy == ContiguousPolicy::Reject {
        log::debug!(
            "Instance {} needs contiguous memory, skipped",
            inst.info.instance_id
        );
        return false;
    }
    true
}

/// Take one item from each group in key order, repeating until all are empty.
pub fn round_robin<K: Ord, T>(mut groups: BTreeMap<K, VecDeque<T>>) -> Vec<T> {
    let total = groups.values().map(VecDeque::len).sum();
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        for queue in groups.values_mut() {
            if let Some(item) = queue.pop_front() {
                out.push(item);
            }
        }
    }
    out
}
