use dslab_platform::{
    config::{EnergyConfig, HostConfig, LinkConfig, PlatformConfig},
    disk::IoOp,
    error::PlatformError,
    lmm::{MaxMinSystem, SharingPolicy},
    platform::Platform,
    topology::{get_all_racks, get_rack, make_fat_tree_platform, make_star_platform, make_tree_platform},
};

const EPS: f64 = 1e-9;

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {}, got {}",
        expected,
        actual
    );
}

fn build(config: &PlatformConfig) -> Platform {
    Platform::from_config(config, EPS, EPS).unwrap()
}

#[test]
fn maxmin_equal_share() {
    let mut system = MaxMinSystem::new(EPS);
    let cnst = system.add_constraint(100., SharingPolicy::Shared);
    let vars = (0..3)
        .map(|_| {
            let var = system.add_variable(1., None);
            system.expand(cnst, var, 1.);
            var
        })
        .collect::<Vec<_>>();
    assert_eq!(system.variable_count(), 3);
    assert_eq!(system.constraint_concurrency(cnst), 3);
    assert!(system.is_modified());
    system.solve();
    assert!(!system.is_modified());
    for var in vars {
        assert_close(system.value(var), 100. / 3.);
    }
    assert_close(system.constraint_usage(cnst), 100.);

    system.set_constraint_bound(cnst, 60.);
    assert_close(system.constraint_bound(cnst), 60.);
    assert!(system.is_modified());
    system.solve();
    assert_close(system.constraint_usage(cnst), 60.);
}

#[test]
fn maxmin_bottleneck_redistribution() {
    // first variable is limited by the narrow constraint, the second one takes the rest of the wide constraint
    let mut system = MaxMinSystem::new(EPS);
    let wide = system.add_constraint(100., SharingPolicy::Shared);
    let narrow = system.add_constraint(10., SharingPolicy::Shared);
    let a = system.add_variable(1., None);
    system.expand(wide, a, 1.);
    system.expand(narrow, a, 1.);
    let b = system.add_variable(1., None);
    system.expand(wide, b, 1.);
    system.solve();
    assert_close(system.value(a), 10.);
    assert_close(system.value(b), 90.);
}

#[test]
fn maxmin_weights_and_bounds() {
    let mut system = MaxMinSystem::new(EPS);
    let cnst = system.add_constraint(90., SharingPolicy::Shared);
    // sharing weight is the inverse of priority
    let heavy = system.add_variable(0.5, None);
    let light = system.add_variable(1., None);
    system.expand(cnst, heavy, 1.);
    system.expand(cnst, light, 1.);
    system.solve();
    assert_close(system.value(heavy), 60.);
    assert_close(system.value(light), 30.);

    system.set_bound(heavy, Some(20.));
    system.solve();
    assert_close(system.value(heavy), 20.);
    assert_close(system.value(light), 70.);

    system.set_weight(light, 0.);
    system.solve();
    assert_close(system.value(light), 0.);
    assert_close(system.value(heavy), 20.);
}

#[test]
fn maxmin_fat_pipe() {
    let mut system = MaxMinSystem::new(EPS);
    let cnst = system.add_constraint(50., SharingPolicy::FatPipe);
    let a = system.add_variable(1., None);
    let b = system.add_variable(1., None);
    system.expand(cnst, a, 1.);
    system.expand(cnst, b, 1.);
    system.solve();
    assert_close(system.value(a), 50.);
    assert_close(system.value(b), 50.);
}

#[test]
fn maxmin_throughput_function() {
    let mut system = MaxMinSystem::new(EPS);
    let cnst = system.add_constraint(100., SharingPolicy::Shared);
    system.set_throughput_function(cnst, Some(Box::new(|n| if n > 1 { 0.5 } else { 1. })));
    let a = system.add_variable(1., None);
    system.expand(cnst, a, 1.);
    system.solve();
    assert_close(system.value(a), 100.);
    let b = system.add_variable(1., None);
    system.expand(cnst, b, 1.);
    system.solve();
    assert_close(system.value(a), 25.);
    assert_close(system.value(b), 25.);
}

#[test]
fn maxmin_unconstrained_variable() {
    let mut system = MaxMinSystem::new(EPS);
    let free = system.add_variable(1., None);
    let bounded = system.add_variable(1., Some(7.));
    system.solve();
    assert!(system.value(free).is_infinite());
    assert_close(system.value(bounded), 7.);
}

#[test]
fn two_executions_share_host() {
    let mut config = PlatformConfig::default();
    config.hosts.push(HostConfig::new("host", 100.));
    let mut platform = build(&config);
    let a = platform.start_exec(0, 100., 1., None);
    let b = platform.start_exec(0, 100., 1., None);
    assert_close(platform.action_rate(a), 50.);
    assert_close(platform.next_event_delay().unwrap(), 2.);
    let finished = platform.advance(2.);
    assert_eq!(finished, vec![a, b]);
    assert_eq!(platform.model().action_count(), 0);
}

#[test]
fn execution_priority_and_bound() {
    let mut config = PlatformConfig::default();
    config.hosts.push(HostConfig::new("host", 90.));
    let mut platform = build(&config);
    let high = platform.start_exec(0, 1000., 2., None);
    let low = platform.start_exec(0, 1000., 1., None);
    assert_close(platform.action_rate(high), 60.);
    assert_close(platform.action_rate(low), 30.);

    platform.set_action_bound(high, Some(10.));
    assert_close(platform.action_rate(high), 10.);
    assert_close(platform.action_rate(low), 80.);

    platform.set_action_bound(high, None);
    platform.set_action_priority(high, 1.);
    assert_close(platform.action_rate(high), 45.);
}

#[test]
fn execution_uses_one_core() {
    let mut config = PlatformConfig::default();
    let mut host = HostConfig::new("host", 100.);
    host.cores = 2;
    config.hosts.push(host);
    let mut platform = build(&config);
    let first = platform.start_exec(0, 1000., 1., None);
    assert_close(platform.action_rate(first), 100.);
    let second = platform.start_exec(0, 1000., 1., None);
    assert_close(platform.action_rate(second), 100.);
    let third = platform.start_exec(0, 1000., 1., None);
    for id in [first, second, third] {
        assert_close(platform.action_rate(id), 200. / 3.);
    }
    assert_close(platform.host_load(0), 200.);
}

#[test]
fn suspended_action_does_not_progress() {
    let mut config = PlatformConfig::default();
    config.hosts.push(HostConfig::new("host", 100.));
    let mut platform = build(&config);
    let id = platform.start_exec(0, 100., 1., None);
    assert!(platform.advance(0.5).is_empty());
    platform.suspend_action(id);
    assert_eq!(platform.next_event_delay(), None);
    assert!(platform.advance(10.).is_empty());
    assert_close(platform.action_remaining(id).unwrap(), 50.);
    platform.resume_action(id);
    assert_close(platform.next_event_delay().unwrap(), 0.5);
}

#[test]
fn communications_share_link() {
    let config = make_star_platform(2, 1., 100.);
    let mut platform = build(&config);
    let route = platform.route(0, 1).unwrap();
    assert_eq!(route.links.len(), 2);
    assert_close(route.latency, 2e-4);

    let ids = (0..3)
        .map(|_| platform.start_comm(&route, 100., 1., None))
        .collect::<Vec<_>>();
    // nothing is transferred during latency
    assert_close(platform.next_event_delay().unwrap(), 2e-4);
    assert!(platform.advance(2e-4).is_empty());
    for &id in ids.iter() {
        assert_close(platform.action_rate(id), 100. / 3.);
    }
    assert_close(platform.next_event_delay().unwrap(), 3.);
    assert_eq!(platform.advance(3.), ids);
    let link = platform.link_by_name("host_0-switch").unwrap();
    assert_close(platform.link(link).transferred(), 300.);
}

#[test]
fn communication_rate_limit() {
    let config = make_star_platform(2, 1., 100.);
    let mut platform = build(&config);
    let route = platform.route(0, 1).unwrap();
    let limited = platform.start_comm(&route, 100., 1., Some(10.));
    let other = platform.start_comm(&route, 100., 1., None);
    platform.advance(2e-4);
    assert_close(platform.action_rate(limited), 10.);
    assert_close(platform.action_rate(other), 90.);
}

#[test]
fn parallel_task_progresses_at_bottleneck_rate() {
    let config = make_star_platform(2, 10., 100.);
    let mut platform = build(&config);
    // cpu of host 1 limits the task to a quarter per second, the link alone would allow a half
    let task = platform
        .start_parallel_exec(&[0, 1], &[20., 40.], &[0., 200., 0., 0.], 1., None)
        .unwrap();
    assert_close(platform.next_event_delay().unwrap(), 2e-4);
    assert!(platform.advance(2e-4).is_empty());
    assert_close(platform.action_rate(task), 0.25);
    assert_close(platform.host_load(0), 5.);
    assert_close(platform.host_load(1), 10.);
    let uplink = platform.link_by_name("host_1-switch").unwrap();
    assert_close(platform.link_load(uplink), 50.);

    platform.set_action_bound(task, Some(0.1));
    assert_close(platform.action_rate(task), 0.1);
    platform.set_action_bound(task, None);
    let delay = platform.next_event_delay().unwrap();
    assert_eq!(platform.advance(delay), vec![task]);
    let link = platform.link_by_name("host_0-switch").unwrap();
    assert_close(platform.link(link).transferred(), 200.);
}

#[test]
fn parallel_task_validation() {
    let config = make_star_platform(2, 10., 100.);
    let mut platform = build(&config);
    assert!(matches!(
        platform.start_parallel_exec(&[0, 1], &[1.], &[], 1., None),
        Err(PlatformError::InvalidValue { .. })
    ));
    assert!(matches!(
        platform.start_parallel_exec(&[0, 1], &[1., 1.], &[1., 2., 3.], 1., None),
        Err(PlatformError::InvalidValue { .. })
    ));
    assert!(matches!(
        platform.start_parallel_exec(&[0], &[-1.], &[], 1., None),
        Err(PlatformError::InvalidValue { .. })
    ));
    // nothing to compute or send
    let empty = platform.start_parallel_exec(&[0, 1], &[0., 0.], &[], 1., None).unwrap();
    assert_close(platform.next_event_delay().unwrap(), 0.);
    assert_eq!(platform.advance(0.), vec![empty]);
}

#[test]
fn fat_pipe_link() {
    let mut config = PlatformConfig::default();
    config.hosts.push(HostConfig::new("a", 1.));
    config.hosts.push(HostConfig::new("b", 1.));
    let mut link = LinkConfig::new("backbone", 100., 0.);
    link.sharing = SharingPolicy::FatPipe;
    config.links.push(link);
    config.edges.push(dslab_platform::config::EdgeConfig {
        from: "a".to_string(),
        to: "b".to_string(),
        link: "backbone".to_string(),
    });
    let mut platform = build(&config);
    let route = platform.route(0, 1).unwrap();
    let first = platform.start_comm(&route, 100., 1., None);
    let second = platform.start_comm(&route, 100., 1., None);
    assert_close(platform.action_rate(first), 100.);
    assert_close(platform.action_rate(second), 100.);
}

#[test]
fn tree_routing() {
    let config = make_tree_platform(2, 2, 1., 100.);
    let mut platform = build(&config);
    let h00 = platform.host_by_name("host_0_0").unwrap();
    let h01 = platform.host_by_name("host_0_1").unwrap();
    let h10 = platform.host_by_name("host_1_0").unwrap();
    assert_eq!(platform.route(h00, h01).unwrap().links.len(), 2);
    assert_eq!(platform.route(h00, h10).unwrap().links.len(), 4);
    let local = platform.route(h00, h00).unwrap();
    assert_eq!(local.links, vec![platform.host(h00).loopback()]);
    assert_eq!(platform.link(local.links[0]).sharing(), SharingPolicy::FatPipe);
}

#[test]
fn fat_tree_racks() {
    let config = make_fat_tree_platform(2, 3, 2, 1., 100.);
    assert_eq!(config.hosts.len(), 6);
    let racks = get_all_racks(&config);
    assert_eq!(racks["host_2_1"], 2);
    assert_eq!(get_rack("switch_0"), None);
    let mut platform = build(&config);
    let src = platform.host_by_name("host_0_0").unwrap();
    let dst = platform.host_by_name("host_2_1").unwrap();
    assert_eq!(platform.route(src, dst).unwrap().links.len(), 4);
}

#[test]
fn explicit_route_overrides_graph() {
    let yaml = r#"
hosts:
  - name: a
    speeds: [1.0]
  - name: b
    speeds: [1.0]
links:
  - name: slow
    bandwidth: 10.0
    latency: 1.0
  - name: fast
    bandwidth: 1000.0
routers: [router]
edges:
  - {from: a, to: router, link: slow}
  - {from: router, to: b, link: slow}
routes:
  - {src: a, dst: b, links: [fast]}
"#;
    let config = PlatformConfig::from_yaml_str(yaml).unwrap();
    let mut platform = build(&config);
    let fast = platform.link_by_name("fast").unwrap();
    assert_eq!(platform.route(0, 1).unwrap().links, vec![fast]);
    assert_eq!(platform.route(1, 0).unwrap().links, vec![fast]);
}

#[test]
fn missing_route() {
    let mut config = PlatformConfig::default();
    config.hosts.push(HostConfig::new("a", 1.));
    config.hosts.push(HostConfig::new("b", 1.));
    let mut platform = build(&config);
    assert!(matches!(platform.route(0, 1), Err(PlatformError::NoRoute { .. })));
    assert!(matches!(platform.host_by_name("c"), Err(PlatformError::UnknownHost(_))));
}

#[test]
fn invalid_configs() {
    let mut config = PlatformConfig::default();
    config.hosts.push(HostConfig::new("a", 1.));
    config.hosts.push(HostConfig::new("a", 1.));
    assert!(matches!(
        Platform::from_config(&config, EPS, EPS),
        Err(PlatformError::DuplicateName(_))
    ));

    let mut config = PlatformConfig::default();
    let mut host = HostConfig::new("a", 1.);
    host.pstate = 3;
    config.hosts.push(host);
    assert!(matches!(
        Platform::from_config(&config, EPS, EPS),
        Err(PlatformError::InvalidPstate { .. })
    ));

    let mut config = PlatformConfig::default();
    config.hosts.push(HostConfig::new("a", -1.));
    assert!(matches!(
        Platform::from_config(&config, EPS, EPS),
        Err(PlatformError::InvalidValue { .. })
    ));
}

#[test]
fn host_off_and_pstates() {
    let mut config = PlatformConfig::default();
    let mut host = HostConfig::new("host", 100.);
    host.speeds.push(50.);
    config.hosts.push(host);
    let mut platform = build(&config);
    let id = platform.start_exec(0, 100., 1., None);
    platform.set_pstate(0, 1).unwrap();
    assert_close(platform.action_rate(id), 50.);
    assert!(platform.set_pstate(0, 2).is_err());

    platform.set_host_state(0, false);
    assert!(!platform.host(0).is_on());
    assert_close(platform.action_rate(id), 0.);
    assert_eq!(platform.next_event_delay(), None);

    platform.set_host_state(0, true);
    platform.set_host_availability(0, 0.5);
    assert_close(platform.action_rate(id), 25.);
    let host = platform.host(0);
    assert_close(host.peak_speed(), 50.);
    assert_close(host.speed(), 25.);
    assert_eq!(host.pstate_speed(0), Some(100.));
    assert_eq!(host.pstate_speed(2), None);
}

#[test]
fn energy_consumption() {
    let mut config = PlatformConfig::default();
    let mut host = HostConfig::new("host", 100.);
    host.energy = Some(EnergyConfig {
        idle_watts: vec![100.],
        busy_watts: vec![200.],
        off_watts: 10.,
    });
    config.hosts.push(host);
    let mut platform = build(&config);
    platform.start_exec(0, 100., 1., None);
    assert_close(platform.host_power(0), 200.);
    assert_eq!(platform.advance(1.).len(), 1);
    assert_close(platform.host(0).energy(), 200.);
    platform.advance(1.);
    assert_close(platform.host(0).energy(), 300.);
    platform.set_host_state(0, false);
    platform.advance(1.);
    assert_close(platform.host(0).energy(), 310.);
}

#[test]
fn disk_io() {
    let yaml = r#"
hosts:
  - name: storage
    speeds: [1.0]
    disks:
      - {name: ssd, read_bandwidth: 200.0, write_bandwidth: 100.0}
"#;
    let config = PlatformConfig::from_yaml_str(yaml).unwrap();
    let mut platform = build(&config);
    let disk = platform.disk_by_name(0, "ssd").unwrap();
    let read = platform.start_io(disk, IoOp::Read, 200., 1.);
    let write = platform.start_io(disk, IoOp::Write, 200., 1.);
    assert_close(platform.next_event_delay().unwrap(), 1.);
    assert_eq!(platform.advance(1.), vec![read]);
    assert_eq!(platform.advance(1.), vec![write]);
    assert_close(platform.disk(disk).bytes_read(), 200.);
    assert_close(platform.disk(disk).bytes_written(), 200.);
    assert!(platform.disk_by_name(0, "hdd").is_err());
}

#[test]
fn platform_description_formats() {
    let config = make_tree_platform(2, 3, 1e9, 1e8);
    let yaml = config.to_yaml().unwrap();
    assert_eq!(PlatformConfig::from_yaml_str(&yaml).unwrap(), config);
    let json = config.to_json().unwrap();
    assert_eq!(PlatformConfig::from_json_str(&json).unwrap(), config);
    assert!(matches!(PlatformConfig::from_json_str("{"), Err(PlatformError::Json(_))));
}
