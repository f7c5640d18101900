//! Common platform topologies.
//!
//! Host names follow the `host_{rack}_{index}` pattern (or `host_{index}` for a star), so the rack of a host
//! can be recovered with [get_rack].

use std::collections::BTreeMap;

use crate::config::{EdgeConfig, HostConfig, LinkConfig, PlatformConfig};

const SWITCH_LATENCY: f64 = 1e-4;

fn connect(config: &mut PlatformConfig, from: &str, to: &str, bandwidth: f64) {
    let name = format!("{}-{}", from, to);
    config.links.push(LinkConfig::new(&name, bandwidth, SWITCH_LATENCY));
    config.edges.push(EdgeConfig {
        from: from.to_string(),
        to: to.to_string(),
        link: name,
    });
}

/// Creates star topology: `host_count` hosts connected to a single switch.
/// * `host_speed` --- speed of each host in flops per second.
/// * `link_bw` --- bandwidth of the link between the switch and each host.
pub fn make_star_platform(host_count: usize, host_speed: f64, link_bw: f64) -> PlatformConfig {
    let mut config = PlatformConfig::default();
    config.routers.push("switch".to_string());
    for i in 0..host_count {
        let host_name = format!("host_{}", i);
        config.hosts.push(HostConfig::new(&host_name, host_speed));
        connect(&mut config, &host_name, "switch", link_bw);
    }
    config
}

/// Creates tree topology with `star_count` racks and `hosts_per_star` hosts on each one.
/// * `downlink_bw` corresponds to a link bandwidth between rack switch and each host.
/// * Rack switches are connected to the root switch with links of `downlink_bw * hosts_per_star` bandwidth.
pub fn make_tree_platform(star_count: usize, hosts_per_star: usize, host_speed: f64, downlink_bw: f64) -> PlatformConfig {
    let mut config = PlatformConfig::default();
    let root_switch_name = "root_switch".to_string();
    config.routers.push(root_switch_name.clone());

    for i in 0..star_count {
        let switch_name = format!("switch_{}", i);
        config.routers.push(switch_name.clone());
        connect(
            &mut config,
            &root_switch_name,
            &switch_name,
            downlink_bw * hosts_per_star as f64,
        );

        for j in 0..hosts_per_star {
            let host_name = format!("host_{}_{}", i, j);
            config.hosts.push(HostConfig::new(&host_name, host_speed));
            connect(&mut config, &host_name, &switch_name, downlink_bw);
        }
    }
    config
}

/// Creates fat tree topology.
/// * `l2_switch_count` --- number of top-level switches.
/// * `l1_switch_count` --- number of racks.
/// * `hosts_per_switch` --- number of hosts per rack.
/// * `downlink_bw` --- link bandwidth between rack switch and each host.
pub fn make_fat_tree_platform(
    l2_switch_count: usize,
    l1_switch_count: usize,
    hosts_per_switch: usize,
    host_speed: f64,
    downlink_bw: f64,
) -> PlatformConfig {
    let mut config = PlatformConfig::default();
    for i in 0..l2_switch_count {
        config.routers.push(format!("l2_switch_{}", i));
    }

    let uplink_bw = downlink_bw * hosts_per_switch as f64 / l2_switch_count.max(1) as f64;

    for i in 0..l1_switch_count {
        let switch_name = format!("l1_switch_{}", i);
        config.routers.push(switch_name.clone());

        for j in 0..hosts_per_switch {
            let host_name = format!("host_{}_{}", i, j);
            config.hosts.push(HostConfig::new(&host_name, host_speed));
            connect(&mut config, &switch_name, &host_name, downlink_bw);
        }

        for j in 0..l2_switch_count {
            connect(&mut config, &switch_name, &format!("l2_switch_{}", j), uplink_bw);
        }
    }
    config
}

/// Returns rack id of a host created by [make_tree_platform] or [make_fat_tree_platform].
pub fn get_rack(host_name: &str) -> Option<u64> {
    let mut parts = host_name.split('_');
    if parts.next() != Some("host") {
        return None;
    }
    let rack = parts.next()?.parse().ok()?;
    parts.next()?;
    Some(rack)
}

/// Returns rack id for all hosts of a platform which follow the naming scheme.
pub fn get_all_racks(config: &PlatformConfig) -> BTreeMap<String, u64> {
    config
        .hosts
        .iter()
        .filter_map(|host| get_rack(&host.name).map(|rack| (host.name.clone(), rack)))
        .collect()
}
