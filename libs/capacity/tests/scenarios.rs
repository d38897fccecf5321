use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use capsched_capacity::{
    BindingSpec, BindingUpdate, Coefficient, DcNodeBinding, Fleet, HasCachedResources, Hypervisor,
    Node, NodeStatus, NodeStorage, PlacementScheduler, Recompute, Requirements, Resources,
    Settings, Strategy, Vm, VmDefinition,
};
use capsched_id::{DcId, NodeId, VmId};
use proptest::prelude::*;
use rstest::rstest;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capsched_capacity=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

fn add_node(fleet: &mut Fleet, cpu: i64, ram: i64, disk: i64) -> NodeId {
    let id = NodeId::new();
    fleet
        .register_node(Node::new(id, format!("cn-{id}"), cpu, ram).with_status(NodeStatus::Online))
        .unwrap();
    fleet
        .add_node_storage(id, NodeStorage::new("zones", disk, Coefficient::ONE))
        .unwrap();
    id
}

fn zone(dc: DcId, cpu: i64, ram: i64) -> Vm {
    Vm::new(
        VmId::new(),
        dc,
        Hypervisor::Zone,
        VmDefinition::new(cpu, ram),
        &Settings::default(),
    )
}

fn free(fleet: &Fleet, dc: DcId, node: NodeId) -> Resources {
    fleet.binding(dc, node).unwrap().cached_free()
}

#[rstest]
#[case(5, false)]
#[case(4, true)]
#[case(3, true)]
fn scenario_oversubscribed_cpu(#[case] request: i64, #[case] accepted: bool) {
    let mut fleet = Fleet::default();
    let node = add_node(&mut fleet, 8, 65_536, 10_000);
    fleet
        .set_coefficients(node, "2.0".parse().unwrap(), Coefficient::ONE)
        .unwrap();
    let dc = DcId::new();
    fleet.attach(dc, node, BindingSpec::shared()).unwrap();
    for _ in 0..3 {
        fleet.add_vm(node, zone(dc, 4, 1024), Recompute::Now).unwrap();
    }

    assert_eq!(fleet.binding(dc, node).unwrap().totals().cpu, 16);
    assert_eq!(free(&fleet, dc, node).cpu, 4);

    let chosen = fleet.choose_node(dc, &Requirements::new(request, 512));
    assert_eq!(chosen.is_ok(), accepted);
    if !accepted {
        assert!(chosen.unwrap_err().is_capacity_exhausted());
    }
}

#[test]
fn scenario_reservation_shrinks_shared_tenants() {
    let mut fleet = Fleet::default();
    let node = add_node(&mut fleet, 16, 32_768, 10_000);
    let (a, b, reserving) = (DcId::new(), DcId::new(), DcId::new());
    fleet.attach(a, node, BindingSpec::shared()).unwrap();
    fleet.attach(b, node, BindingSpec::shared()).unwrap();
    fleet.add_vm(node, zone(a, 1, 1024), Recompute::Now).unwrap();

    let (before_a, before_b) = (free(&fleet, a, node), free(&fleet, b, node));
    fleet
        .attach(
            reserving,
            node,
            BindingSpec::reserved(Resources::new(0, 4096, 0)),
        )
        .unwrap();

    assert_eq!(free(&fleet, a, node).ram, before_a.ram - 4096);
    assert_eq!(free(&fleet, b, node).ram, before_b.ram - 4096);
    assert_eq!(free(&fleet, a, node).cpu, before_a.cpu);

    // Detaching gives it back.
    fleet.detach(reserving, node).unwrap();
    assert_eq!(free(&fleet, a, node), before_a);
}

#[test]
fn scenario_shared_limit_bounded_by_node() {
    let mut fleet = Fleet::default();
    let node = add_node(&mut fleet, 16, 32_768, 10_000);
    let (limited, noisy) = (DcId::new(), DcId::new());
    fleet.attach(noisy, node, BindingSpec::shared()).unwrap();
    fleet
        .attach(
            limited,
            node,
            BindingSpec::shared_limit(Resources::new(8, 2000, 5000)),
        )
        .unwrap();
    fleet
        .add_vm(node, zone(noisy, 1, 32_268), Recompute::Now)
        .unwrap();

    let binding = fleet.binding(limited, node).unwrap();
    assert_eq!(binding.cached_free().ram, 500);
    assert_eq!(binding.totals().ram, 2000);
    assert_eq!(binding.nonreserved_total().map(|t| t.ram), Some(32_768));
}

#[test]
fn overcommitted_reservation_is_not_clamped() {
    let mut fleet = Fleet::default();
    let node = add_node(&mut fleet, 4, 4096, 1000);
    let dc = DcId::new();
    fleet
        .attach(dc, node, BindingSpec::reserved(Resources::new(2, 1024, 100)))
        .unwrap();
    fleet.add_vm(node, zone(dc, 3, 2048), Recompute::Now).unwrap();

    assert_eq!(free(&fleet, dc, node), Resources::new(-1, -1024, 100));
}

#[test]
fn recompute_is_idempotent() {
    let mut fleet = Fleet::default();
    let node = add_node(&mut fleet, 16, 32_768, 10_000);
    let (a, b) = (DcId::new(), DcId::new());
    fleet.attach(a, node, BindingSpec::shared()).unwrap();
    fleet
        .attach(b, node, BindingSpec::reserved(Resources::new(4, 4096, 1000)))
        .unwrap();
    fleet.add_vm(node, zone(a, 2, 2048), Recompute::Now).unwrap();
    fleet.add_vm(node, zone(b, 1, 512), Recompute::Now).unwrap();

    fleet.update_resources(node).unwrap();
    let first = fleet.node(node).unwrap().clone();
    fleet.update_resources(node).unwrap();
    fleet.update_all(node).unwrap();
    assert_eq!(fleet.node(node).unwrap(), &first);
}

#[test]
fn strategy_switch_round_trips() {
    let mut fleet = Fleet::default();
    let node = add_node(&mut fleet, 16, 32_768, 10_000);
    let (dc, other) = (DcId::new(), DcId::new());
    fleet
        .attach(dc, node, BindingSpec::reserved(Resources::new(4, 8192, 2000)))
        .unwrap();
    fleet.attach(other, node, BindingSpec::shared()).unwrap();
    fleet.add_vm(node, zone(dc, 1, 1024), Recompute::Now).unwrap();
    let original: Vec<DcNodeBinding> = fleet.node(node).unwrap().bindings.values().cloned().collect();

    for strategy in [Strategy::Shared, Strategy::SharedLimit, Strategy::Reserved] {
        fleet
            .update_binding(
                dc,
                node,
                BindingUpdate {
                    strategy: Some(strategy),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    let after: Vec<DcNodeBinding> = fleet.node(node).unwrap().bindings.values().cloned().collect();
    assert_eq!(after, original);
}

#[test]
fn choose_prefers_priority_then_fullest() {
    let mut fleet = Fleet::default();
    let dc = DcId::new();
    let roomy = add_node(&mut fleet, 32, 65_536, 10_000);
    let tight = add_node(&mut fleet, 4, 8192, 10_000);
    let preferred = add_node(&mut fleet, 64, 131_072, 10_000);
    fleet.attach(dc, roomy, BindingSpec::shared()).unwrap();
    fleet.attach(dc, tight, BindingSpec::shared()).unwrap();
    fleet
        .attach(dc, preferred, BindingSpec::shared().with_priority(500))
        .unwrap();

    let req = Requirements::new(2, 2048);
    assert_eq!(fleet.choose_node(dc, &req).unwrap(), preferred);

    let excluded = BTreeSet::from([preferred]);
    assert_eq!(fleet.choose_node_excluding(dc, &req, &excluded).unwrap(), tight);

    let big = Requirements::new(8, 2048);
    assert_eq!(fleet.choose_node_excluding(dc, &big, &excluded).unwrap(), roomy);
}

#[test]
fn choose_skips_offline_and_non_compute_nodes() {
    let mut fleet = Fleet::default();
    let dc = DcId::new();
    let offline = add_node(&mut fleet, 4, 4096, 1000);
    let storage = add_node(&mut fleet, 4, 4096, 1000);
    fleet.attach(dc, offline, BindingSpec::shared()).unwrap();
    fleet.attach(dc, storage, BindingSpec::shared()).unwrap();

    fleet.set_node_status(offline, NodeStatus::Offline).unwrap();
    fleet.set_compute(storage, false).unwrap();

    let err = fleet.choose_node(dc, &Requirements::new(1, 1)).unwrap_err();
    assert!(err.is_capacity_exhausted());
}

#[test]
fn choose_ignores_other_tenants_bindings() {
    let mut fleet = Fleet::default();
    let node = add_node(&mut fleet, 4, 4096, 1000);
    fleet.attach(DcId::new(), node, BindingSpec::shared()).unwrap();
    assert!(fleet
        .choose_node(DcId::new(), &Requirements::new(1, 1))
        .is_err());
}

#[test]
fn non_local_pools_accept_when_any_one_fits() {
    let mut fleet = Fleet::default();
    let dc = DcId::new();
    let node = add_node(&mut fleet, 8, 8192, 1000);
    fleet.attach(dc, node, BindingSpec::shared()).unwrap();
    for (zpool, size) in [("fast", 100), ("bulk", 10_000)] {
        fleet
            .add_node_storage(node, NodeStorage::new(zpool, size, Coefficient::ONE))
            .unwrap();
        fleet.attach_storage(node, zpool, dc).unwrap();
    }

    // "fast" cannot take 500 MB but "bulk" can cover its own share.
    let req = Requirements::new(1, 1)
        .with_disk("fast", 500)
        .with_disk("bulk", 500);
    assert_eq!(fleet.choose_node(dc, &req).unwrap(), node);

    let only_fast = Requirements::new(1, 1).with_disk("fast", 500);
    assert!(fleet.choose_node(dc, &only_fast).is_err());

    fleet.set_storage_free(node, "fast", 600).unwrap();
    assert_eq!(fleet.choose_node(dc, &only_fast).unwrap(), node);
}

#[test]
fn local_pool_checked_against_binding() {
    let mut fleet = Fleet::default();
    let dc = DcId::new();
    let node = add_node(&mut fleet, 8, 8192, 1000);
    fleet
        .attach(dc, node, BindingSpec::shared_limit(Resources::new(8, 8192, 300)))
        .unwrap();

    let fits = Requirements::new(1, 1).with_disk("zones", 300);
    assert!(fleet.choose_node(dc, &fits).is_ok());
    let too_big = Requirements::new(1, 1).with_disk("zones", 301);
    assert!(fleet.choose_node(dc, &too_big).is_err());
}

#[test]
fn hvm_requirements_include_overhead() {
    let settings = Settings::default();
    let vm = Vm::new(
        VmId::new(),
        DcId::new(),
        Hypervisor::Kvm,
        VmDefinition::new(2, 2048)
            .with_disk("zones", 10_240)
            .with_disk("data", 4096),
        &settings,
    );
    let req = Requirements::for_vm(&vm);
    assert_eq!(req.ram, 2048 + 256);
    assert_eq!(req.disk_on(Some("zones")), 10_240);
    assert_eq!(req.disk_on(Some("data")), 4096);
}

#[test]
fn concurrent_placements_never_overshoot() {
    init_tracing();
    let mut fleet = Fleet::default();
    let dc = DcId::new();
    let nodes: Vec<NodeId> = (0..3).map(|_| add_node(&mut fleet, 8, 16_384, 10_000)).collect();
    for node in &nodes {
        fleet.attach(dc, *node, BindingSpec::shared()).unwrap();
    }
    let scheduler = Arc::new(PlacementScheduler::new(fleet));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                (0..4)
                    .filter(|_| scheduler.place(zone(dc, 1, 1024)).is_ok())
                    .count()
            })
        })
        .collect();
    let placed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // 3 nodes x 8 cores.
    assert_eq!(placed, 24);
    scheduler
        .with_fleet(|fleet| {
            for node in &nodes {
                assert_eq!(fleet.binding(dc, *node)?.cached_free().cpu, 0);
                assert_eq!(fleet.node(*node)?.vms.len(), 8);
            }
            Ok(())
        })
        .unwrap();
}

proptest! {
    #[test]
    fn placements_keep_free_within_total(
        requests in prop::collection::vec((1i64..6, 256i64..8192), 1..40),
        reserved_ram in 0i64..16_384,
    ) {
        let mut fleet = Fleet::default();
        let (shared, reserving) = (DcId::new(), DcId::new());
        let nodes: Vec<NodeId> = (0..2).map(|_| add_node(&mut fleet, 8, 32_768, 10_000)).collect();
        for node in &nodes {
            fleet.attach(shared, *node, BindingSpec::shared()).unwrap();
            fleet
                .attach(reserving, *node, BindingSpec::reserved(Resources::new(2, reserved_ram, 0)))
                .unwrap();
        }
        let scheduler = PlacementScheduler::new(fleet);

        for (cpu, ram) in requests {
            if let Err(e) = scheduler.place(zone(shared, cpu, ram)) {
                prop_assert!(e.is_capacity_exhausted());
            }
        }

        let fleet = scheduler.into_inner().unwrap();
        for node in &nodes {
            let binding = fleet.binding(shared, *node).unwrap();
            let (free, total) = (binding.cached_free(), binding.totals());
            prop_assert!(free.cpu >= 0 && free.ram >= 0 && free.disk >= 0);
            prop_assert!(total.covers(&free));

            let mut again = fleet.clone();
            again.update_resources(*node).unwrap();
            prop_assert_eq!(again.node(*node).unwrap(), fleet.node(*node).unwrap());
        }
    }
}
