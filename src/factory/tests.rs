// ============================================================================
// File: src/factory/tests.rs
// ----------------------------------------------------------------------------
// Test suite for the factory orchestrator
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use super::{Factory, FactoryConfig};
use crate::backends::cache::CacheBackend;
use crate::backends::direct::DirectBackend;
use crate::backends::remote::server::RemoteCacheServer;
use crate::backends::template::ramdisk::PlainDirRamdisk;
use crate::config::{HypervisorType, VMConfig};
use crate::error::FactoryError;
use crate::hypervisor::mock::{MockRunState, MockVmm};
use crate::vm::Vm;

fn test_config() -> VMConfig {
    VMConfig::new(HypervisorType::Qemu, 1, 256)
}

fn direct_factory_config() -> FactoryConfig {
    FactoryConfig {
        vm_config: test_config(),
        ..Default::default()
    }
}

async fn build(vmm: &Arc<MockVmm>, config: FactoryConfig) -> Factory {
    Factory::new(config, vmm.handles(), Arc::new(PlainDirRamdisk))
        .await
        .expect("factory")
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn assert_running(vmm: &Arc<MockVmm>, vm: &Vm, cpus: u32, memory_mb: u32) {
    assert_eq!(vm.cpus(), cpus);
    assert_eq!(vm.memory_mb(), memory_mb);
    let state = vmm.state(vm.id()).expect("state");
    assert_eq!(state.run_state, MockRunState::Running);
    assert_eq!(state.cpus, cpus);
    assert_eq!(state.memory_mb, memory_mb);
}

#[tokio::test]
async fn same_config_yields_running_vm() {
    let vmm = MockVmm::new();
    let factory = build(&vmm, direct_factory_config()).await;

    let vm = factory.get_vm(&test_config()).await.expect("VM");
    assert_running(&vmm, &vm, 1, 256);

    factory.close().await.expect("close");
}

#[tokio::test]
async fn vcpu_shortfall_is_hot_added_and_onlined() {
    let vmm = MockVmm::new();
    let factory = build(&vmm, direct_factory_config()).await;

    let requested = VMConfig::new(HypervisorType::Qemu, 2, 256);
    let vm = factory.get_vm(&requested).await.expect("VM");
    assert_running(&vmm, &vm, 2, 256);

    factory.close().await.expect("close");
}

#[tokio::test]
async fn memory_shortfall_is_hot_added() {
    let vmm = MockVmm::new();
    let factory = build(&vmm, direct_factory_config()).await;

    let requested = VMConfig::new(HypervisorType::Qemu, 1, 1024);
    let vm = factory.get_vm(&requested).await.expect("VM");
    assert_running(&vmm, &vm, 1, 1024);

    factory.close().await.expect("close");
}

#[tokio::test]
async fn smaller_request_is_not_shrunk() {
    let vmm = MockVmm::new();
    let factory = build(
        &vmm,
        FactoryConfig {
            vm_config: VMConfig::new(HypervisorType::Qemu, 4, 2048),
            ..Default::default()
        },
    )
    .await;

    // hotplug only grows; a smaller request keeps the base sizing
    let requested = VMConfig::new(HypervisorType::Qemu, 1, 256);
    let vm = factory.get_vm(&requested).await.expect("VM");
    assert_running(&vmm, &vm, 4, 2048);

    factory.close().await.expect("close");
}

#[tokio::test]
async fn incompatible_request_falls_back_to_direct() {
    let vmm = MockVmm::new();
    let factory = build(&vmm, direct_factory_config()).await;

    let requested = VMConfig::new(HypervisorType::Firecracker, 2, 512);
    let vm = factory.get_vm(&requested).await.expect("fallback VM");
    assert_running(&vmm, &vm, 2, 512);
    assert_eq!(
        vmm.state(vm.id())
            .expect("state")
            .config
            .hypervisor_type,
        HypervisorType::Firecracker
    );

    factory.close().await.expect("close");
}

#[tokio::test]
async fn invalid_request_creates_nothing() {
    let vmm = MockVmm::new();
    let factory = build(&vmm, direct_factory_config()).await;

    let requested = VMConfig::new(HypervisorType::Qemu, 0, 256);
    assert!(matches!(
        factory.get_vm(&requested).await,
        Err(FactoryError::InvalidConfig { .. })
    ));
    assert_eq!(vmm.created_count(), 0);

    factory.close().await.expect("close");
}

#[tokio::test]
async fn invalid_factory_config_rejected() {
    let vmm = MockVmm::new();

    let result = Factory::new(
        FactoryConfig {
            vm_config: VMConfig::new(HypervisorType::Qemu, 0, 0),
            ..Default::default()
        },
        vmm.handles(),
        Arc::new(PlainDirRamdisk),
    )
    .await;
    assert!(matches!(result, Err(FactoryError::InvalidConfig { .. })));
}

#[tokio::test]
async fn fetch_only_with_cache_rejected() {
    let vmm = MockVmm::new();

    let result = Factory::new(
        FactoryConfig {
            use_template: true,
            fetch_only: true,
            cache_size: 2,
            vm_config: test_config(),
            ..Default::default()
        },
        vmm.handles(),
        Arc::new(PlainDirRamdisk),
    )
    .await;
    assert!(matches!(result, Err(FactoryError::InvalidConfig { .. })));
}

#[tokio::test]
async fn runtime_failure_stops_the_fetched_vm() {
    let vmm = MockVmm::new();
    let factory = build(&vmm, direct_factory_config()).await;

    vmm.fail_op("reseed_rng");
    assert!(factory.get_vm(&test_config()).await.is_err());
    assert_eq!(vmm.live_count(), 0, "the fetched VM must be stopped");

    factory.close().await.expect("close");
}

#[tokio::test]
async fn hotplug_failure_stops_the_fetched_vm() {
    let vmm = MockVmm::new();
    let factory = build(&vmm, direct_factory_config()).await;

    vmm.fail_op("add_vcpus");
    let requested = VMConfig::new(HypervisorType::Qemu, 2, 256);
    assert!(factory.get_vm(&requested).await.is_err());
    assert_eq!(vmm.live_count(), 0);

    factory.close().await.expect("close");
}

#[tokio::test]
async fn template_factory_serves_clones() {
    let dir = tempfile::tempdir().expect("tempdir");
    let vmm = MockVmm::new();
    let factory = build(
        &vmm,
        FactoryConfig {
            use_template: true,
            template_path: dir.path().join("template"),
            template_settle_timeout: Duration::from_millis(200),
            vm_config: test_config(),
            ..Default::default()
        },
    )
    .await;

    let vm = factory.get_vm(&test_config()).await.expect("clone");
    assert_running(&vmm, &vm, 1, 256);
    assert!(
        vmm.state(vm.id())
            .expect("state")
            .config
            .hypervisor_config
            .boot_from_template
    );

    factory.close().await.expect("close");
}

#[tokio::test]
async fn fetch_only_factory_attaches_to_existing_template() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("template");
    let vmm = MockVmm::new();

    let template_config = FactoryConfig {
        use_template: true,
        template_path: path.clone(),
        template_settle_timeout: Duration::from_millis(200),
        vm_config: test_config(),
        ..Default::default()
    };
    let creator = build(&vmm, template_config.clone()).await;

    let attached = build(
        &vmm,
        FactoryConfig {
            fetch_only: true,
            ..template_config.clone()
        },
    )
    .await;
    assert_eq!(attached.config(), test_config());

    // after the creator destroys the state, attach fails
    creator.close().await.expect("close");
    let result = Factory::new(
        FactoryConfig {
            fetch_only: true,
            ..template_config
        },
        vmm.handles(),
        Arc::new(PlainDirRamdisk),
    )
    .await;
    assert!(matches!(result, Err(FactoryError::TemplateMissing { .. })));
}

#[tokio::test]
async fn cached_factory_replenishes_after_each_consumption() {
    let vmm = MockVmm::new();
    let factory = build(
        &vmm,
        FactoryConfig {
            cache_size: 2,
            vm_config: test_config(),
            ..Default::default()
        },
    )
    .await;

    for _ in 0..3 {
        let vm = factory.get_vm(&test_config()).await.expect("pooled VM");
        assert_running(&vmm, &vm, 1, 256);
        vm.stop().await.expect("stop");
    }

    // pooled entries plus in-flight refills never exceed the capacity
    let statuses = factory.vm_status().expect("status");
    let idle = statuses.iter().filter(|s| !s.occupied).count();
    assert!(idle <= 2);

    factory.close().await.expect("close");
    assert_eq!(vmm.live_count(), 0);
}

#[tokio::test]
async fn canceled_get_vm_does_not_strand_a_pooled_vm() {
    let vmm = MockVmm::new();
    let factory = build(
        &vmm,
        FactoryConfig {
            cache_size: 1,
            vm_config: test_config(),
            ..Default::default()
        },
    )
    .await;

    // the caller gives up while resume hangs mid-preparation
    vmm.hang_op("resume_vm");
    let result =
        tokio::time::timeout(Duration::from_millis(200), factory.get_vm(&test_config())).await;
    assert!(result.is_err(), "get_vm should still be waiting");
    vmm.clear_hang("resume_vm");

    factory.close().await.expect("close");
    // the checked-out VM is stopped in the background, not stranded
    wait_until(|| vmm.live_count() == 0).await;
}

#[tokio::test]
async fn status_unsupported_without_pool() {
    let vmm = MockVmm::new();
    let factory = build(&vmm, direct_factory_config()).await;

    assert!(matches!(
        factory.vm_status(),
        Err(FactoryError::StatusUnsupported { .. })
    ));

    factory.close().await.expect("close");
}

#[tokio::test]
async fn remote_cache_factory_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("cache.sock");
    let vmm = MockVmm::new();

    let inner = Arc::new(DirectBackend::new(test_config(), vmm.handles()));
    let server =
        RemoteCacheServer::bind(socket.clone(), CacheBackend::new(inner, 2)).expect("server");

    let factory = build(
        &vmm,
        FactoryConfig {
            use_remote_cache: true,
            remote_cache_endpoint: socket,
            vm_config: test_config(),
            ..Default::default()
        },
    )
    .await;

    let requested = VMConfig::new(HypervisorType::Qemu, 2, 512);
    let vm = factory.get_vm(&requested).await.expect("remote VM");
    assert_running(&vmm, &vm, 2, 512);

    // status stays unsupported on the client leaf
    assert!(matches!(
        factory.vm_status(),
        Err(FactoryError::StatusUnsupported { .. })
    ));

    vm.stop().await.expect("stop");
    factory.close().await.expect("close");
    server.shutdown().await.expect("shutdown");
}
