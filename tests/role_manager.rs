//! Role manager client against a simulated role manager device.

use std::time::Duration;

use jacbus::constants::{SRV_BUTTON, SRV_LED, SRV_POTENTIOMETER};
use jacbus::{
    Bus, BusEvent, BusOptions, DeviceId, Role, RoleManagerClient, SimulatedDevice,
    SimulatedService, SimulatorRegistry,
};

fn bus() -> Bus {
    let _ = tracing_subscriber::fmt::try_init();
    Bus::new(BusOptions::default()).expect("default options")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<BusEvent>) -> Vec<BusEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn lists_roles_and_binds_through_change_events() -> anyhow::Result<()> {
    let bus = bus();
    let manager = SimulatedDevice::spawn(
        &bus,
        vec![SimulatedService::role_manager(vec![
            Role::unbound("btn", SRV_BUTTON),
            Role::unbound("pot", SRV_POTENTIOMETER),
        ])],
    );
    let button = SimulatedDevice::spawn(&bus, vec![SimulatedService::button()]);
    settle().await;

    let client = RoleManagerClient::find(&bus).expect("role manager announced");
    assert_eq!(client.service().path().device, manager.id());
    client.refresh_roles().await;
    assert!(!client.needs_refresh());
    assert_eq!(client.roles().len(), 2);
    assert_eq!(client.compatible_roles(SRV_BUTTON).len(), 1);
    assert!(client.role("btn").is_none());
    assert!(!client.all_roles_bound());

    let service = bus.device(button.id()).and_then(|d| d.service(1)).expect("button service");
    assert!(client.has_role_for_service(&service));
    let mut events = bus.subscribe();
    client.set_role(&service, "btn").await?;

    // change event, then the debounced refresh
    tokio::time::sleep(Duration::from_millis(400)).await;
    let bound = client.role("btn").expect("btn bound");
    assert_eq!((bound.device_id, bound.service_index), (button.id(), 1));
    assert_eq!(service.role().as_deref(), Some("btn"));
    assert_eq!(manager.roles(1)[0].device_id, button.id());

    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, BusEvent::RoleChange)));
    assert!(seen.iter().any(|e| matches!(
        e,
        BusEvent::ServiceRoleChange { path, role: Some(name) } if path.device == button.id() && name == "btn"
    )));
    Ok(())
}

fn role_changes(seen: &[BusEvent]) -> usize {
    seen.iter().filter(|e| matches!(e, BusEvent::RoleChange)).count()
}

#[tokio::test(start_paused = true)]
async fn role_change_fires_only_when_the_table_differs() -> anyhow::Result<()> {
    let bus = bus();
    let panel = DeviceId::new([0x31; 8]);
    let _manager = SimulatedDevice::spawn(
        &bus,
        vec![SimulatedService::role_manager(vec![Role {
            device_id: panel,
            service_class: SRV_BUTTON,
            service_index: 1,
            name: "btn".into(),
            query: None,
        }])],
    );
    let _panel = SimulatedDevice::spawn_with_id(
        &bus,
        panel,
        vec![SimulatedService::button(), SimulatedService::button()],
    );
    let mut events = bus.subscribe();
    settle().await;

    let client = RoleManagerClient::find(&bus).expect("role manager");
    client.refresh_roles().await;
    client.refresh_roles().await;
    assert_eq!(role_changes(&drain(&mut events)), 1);

    // clear and set land in one debounce window
    let second = bus.device(panel).and_then(|d| d.service(2)).expect("second button");
    client.set_role(&second, "btn").await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(role_changes(&drain(&mut events)), 1);

    let bound = client.role("btn").expect("btn bound");
    assert_eq!((bound.device_id, bound.service_index), (panel, 2));
    assert_eq!(second.role().as_deref(), Some("btn"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn moving_a_role_clears_the_previous_holder() -> anyhow::Result<()> {
    let bus = bus();
    let manager = SimulatedDevice::spawn(
        &bus,
        vec![SimulatedService::role_manager(vec![Role::unbound("btn", SRV_BUTTON)])],
    );
    let first = SimulatedDevice::spawn(&bus, vec![SimulatedService::button()]);
    let second = SimulatedDevice::spawn(&bus, vec![SimulatedService::button()]);
    settle().await;

    let client = RoleManagerClient::find(&bus).expect("role manager");
    client.refresh_roles().await;
    let first_service = bus.device(first.id()).and_then(|d| d.service(1)).expect("first");
    let second_service = bus.device(second.id()).and_then(|d| d.service(1)).expect("second");

    client.set_role(&first_service, "btn").await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(first_service.role().as_deref(), Some("btn"));

    client.set_role(&second_service, "btn").await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(first_service.role(), None);
    assert_eq!(second_service.role().as_deref(), Some("btn"));
    let table = manager.roles(1);
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].device_id, second.id());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn clear_all_and_unmount_drop_assignments() -> anyhow::Result<()> {
    let bus = bus();
    let bound_button = DeviceId::new([0x21; 8]);
    let _manager = SimulatedDevice::spawn(
        &bus,
        vec![SimulatedService::role_manager(vec![Role {
            device_id: bound_button,
            service_class: SRV_BUTTON,
            service_index: 1,
            name: "btn".into(),
            query: None,
        }])],
    );
    let _button = SimulatedDevice::spawn_with_id(&bus, bound_button, vec![SimulatedService::button()]);
    settle().await;

    let client = RoleManagerClient::find(&bus).expect("role manager");
    client.refresh_roles().await;
    let service = bus.device(bound_button).and_then(|d| d.service(1)).expect("button");
    assert_eq!(service.role().as_deref(), Some("btn"));
    assert!(client.all_roles_bound());

    client.clear_all_roles().await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(service.role(), None);
    assert!(client.role("btn").is_none());

    client.set_role(&service, "btn").await?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(service.role().as_deref(), Some("btn"));

    client.unmount();
    assert_eq!(service.role(), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn silent_role_manager_reports_an_error() {
    let bus = bus();
    let manager = SimulatedDevice::spawn(&bus, vec![SimulatedService::role_manager(Vec::new())]);
    settle().await;
    let client = RoleManagerClient::find(&bus).expect("role manager");
    manager.set_muted(true);

    let mut events = bus.subscribe();
    client.refresh_roles().await;
    assert!(client.needs_refresh());
    assert!(drain(&mut events).iter().any(|e| matches!(e, BusEvent::RoleError { .. })));
}

#[tokio::test(start_paused = true)]
async fn simulators_fill_unbound_roles_grouped_by_parent() {
    let bus = bus();
    let _manager = SimulatedDevice::spawn(
        &bus,
        vec![SimulatedService::role_manager(vec![
            Role::unbound("kit/button", SRV_BUTTON),
            Role::unbound("kit/light", SRV_LED),
            Role::unbound("knob", SRV_POTENTIOMETER),
            Role::unbound("mystery", 0x1234_5678),
        ])],
    );
    settle().await;

    let client = RoleManagerClient::find(&bus).expect("role manager");
    client.refresh_roles().await;
    let registry = SimulatorRegistry::new();
    let started = client.start_simulators(&registry);
    assert_eq!(started.len(), 2);
    assert_eq!(registry.len(), 2);

    let mut layouts: Vec<Vec<u32>> = started
        .iter()
        .map(|id| {
            let mut classes = bus.device(*id).expect("simulator announced").service_classes();
            classes.sort_unstable();
            classes
        })
        .collect();
    layouts.sort();
    let mut kit = vec![SRV_BUTTON, SRV_LED];
    kit.sort_unstable();
    assert!(layouts.contains(&kit));
    assert!(layouts.contains(&vec![SRV_POTENTIOMETER]));

    registry.stop_all();
    assert!(registry.is_empty());
}
