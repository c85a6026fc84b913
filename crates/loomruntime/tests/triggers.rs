mod common;

use common::{numbers, registry, registry_with_interval, Counters};
use loomcore::{
    ActivationMode, ExecutionEvent, ExecutionMode, FlowError, NodeId, NodeInstance, RunStatus,
    TriggerError, Workflow,
};
use loomruntime::{LoomRuntime, TriggerState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn trigger_workflow() -> (Workflow, NodeId, NodeId) {
    let mut wf = Workflow::new("triggered");
    let trigger = wf.add_node(NodeInstance::new("test.trigger"));
    let sink = wf.add_node(NodeInstance::new("test.sink"));
    wf.connect(trigger, 0, sink, 0);
    (wf, trigger, sink)
}

#[tokio::test]
async fn teardown_runs_once_across_repeated_deactivation() {
    let counters = Counters::default();
    let runtime = LoomRuntime::new(registry(&counters));
    let (wf, trigger, _) = trigger_workflow();
    let id = runtime.load_workflow(wf).await.unwrap();
    let triggers = runtime.triggers(id).await.unwrap();

    triggers.activate(trigger, ActivationMode::Activate).await.unwrap();
    assert_eq!(triggers.state(trigger).await, TriggerState::Active);

    triggers.deactivate(trigger).await.unwrap();
    triggers.deactivate(trigger).await.unwrap();

    assert_eq!(triggers.state(trigger).await, TriggerState::Inactive);
    assert_eq!(counters.activations.load(Ordering::SeqCst), 1);
    assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn double_activation_is_rejected() {
    let counters = Counters::default();
    let runtime = LoomRuntime::new(registry(&counters));
    let (wf, trigger, _) = trigger_workflow();
    let id = runtime.load_workflow(wf).await.unwrap();
    let triggers = runtime.triggers(id).await.unwrap();

    triggers.activate(trigger, ActivationMode::Init).await.unwrap();
    let err = triggers
        .activate(trigger, ActivationMode::Activate)
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::InvalidTransition { .. }));
    assert_eq!(counters.activations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn manual_invocation_of_inactive_trigger_leaves_it_inactive() {
    let counters = Counters::default();
    let runtime = LoomRuntime::new(registry(&counters));
    let (wf, trigger, sink) = trigger_workflow();
    let id = runtime.load_workflow(wf).await.unwrap();

    let result = runtime.invoke_trigger_manually(id, trigger).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(numbers(result.items(sink, 0)), vec![10.0, 11.0]);
    let triggers = runtime.triggers(id).await.unwrap();
    assert_eq!(triggers.state(trigger).await, TriggerState::Inactive);
    // The transient setup is torn down again.
    assert_eq!(counters.activations.load(Ordering::SeqCst), 1);
    assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn manual_invocation_of_active_trigger_reuses_its_handle() {
    let counters = Counters::default();
    let runtime = LoomRuntime::new(registry(&counters));
    let (wf, trigger, _) = trigger_workflow();
    let id = runtime.load_workflow(wf).await.unwrap();
    runtime.activate(id, ActivationMode::Activate).await.unwrap();

    let triggers = runtime.triggers(id).await.unwrap();
    let items = triggers.invoke_manually(trigger).await.unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(triggers.state(trigger).await, TriggerState::Active);
    assert_eq!(counters.activations.load(Ordering::SeqCst), 1);
    assert_eq!(counters.teardowns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn non_trigger_nodes_are_refused() {
    let runtime = LoomRuntime::new(registry(&Counters::default()));
    let (wf, _, sink) = trigger_workflow();
    let id = runtime.load_workflow(wf).await.unwrap();
    let triggers = runtime.triggers(id).await.unwrap();

    assert_eq!(
        triggers.activate(sink, ActivationMode::Activate).await,
        Err(TriggerError::NotATrigger(sink))
    );
    assert!(matches!(
        runtime.invoke_trigger_manually(id, sink).await,
        Err(FlowError::Trigger(TriggerError::NotATrigger(_)))
    ));
}

#[tokio::test]
async fn scheduled_emissions_start_independent_runs() {
    let counters = Counters::default();
    let runtime = LoomRuntime::new(registry_with_interval(&counters, Some(Duration::from_millis(10))));
    let mut events = runtime.subscribe_events();
    let (wf, trigger, _) = trigger_workflow();
    let id = runtime.load_workflow(wf).await.unwrap();

    runtime.activate(id, ActivationMode::Activate).await.unwrap();

    let mut completed = 0;
    while completed < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no run finished in time")
            .unwrap();
        match event {
            ExecutionEvent::RunStarted { start_node, mode, .. } => {
                assert_eq!(start_node, trigger);
                assert_eq!(mode, ExecutionMode::Trigger);
            }
            ExecutionEvent::RunFinished { status, .. } => {
                assert_eq!(status, RunStatus::Completed);
                completed += 1;
            }
            _ => {}
        }
    }

    runtime.unload_workflow(id).await.unwrap();
    assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reload_reactivates_in_update_mode() {
    let counters = Counters::default();
    let runtime = LoomRuntime::new(registry(&counters));
    let mut events = runtime.subscribe_events();
    let (wf, trigger, _) = trigger_workflow();
    let id = runtime.load_workflow(wf.clone()).await.unwrap();
    runtime.activate(id, ActivationMode::Activate).await.unwrap();

    runtime.load_workflow(wf).await.unwrap();

    let triggers = runtime.triggers(id).await.unwrap();
    assert_eq!(triggers.state(trigger).await, TriggerState::Active);
    assert_eq!(counters.activations.load(Ordering::SeqCst), 2);
    assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);

    let mut modes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::TriggerActivated { mode, .. } = event {
            modes.push(mode);
        }
    }
    assert_eq!(modes, vec![ActivationMode::Activate, ActivationMode::Update]);
}

#[tokio::test]
async fn unload_during_activation_releases_the_new_handle() {
    let counters = Counters::default();
    let runtime = Arc::new(LoomRuntime::new(registry(&counters)));
    let mut wf = Workflow::new("slow activation");
    let trigger = wf.add_node(NodeInstance::new("test.slow_trigger"));
    let sink = wf.add_node(NodeInstance::new("test.sink"));
    wf.connect(trigger, 0, sink, 0);
    let id = runtime.load_workflow(wf).await.unwrap();
    let triggers = runtime.triggers(id).await.unwrap();

    let activating = {
        let triggers = Arc::clone(&triggers);
        tokio::spawn(async move { triggers.activate(trigger, ActivationMode::Activate).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(triggers.state(trigger).await, TriggerState::Activating);

    runtime.unload_workflow(id).await.unwrap();
    activating.await.unwrap().unwrap();

    assert_eq!(triggers.state(trigger).await, TriggerState::Inactive);
    assert!(triggers.active_triggers().await.is_empty());
    assert_eq!(counters.activations.load(Ordering::SeqCst), 1);
    assert_eq!(counters.teardowns.load(Ordering::SeqCst), 1);
}
