use async_trait::async_trait;
use loomcore::{
    ActivationMode, Item, NodeError, NodeTypeDescription, NodeTypeDescriptor, ParameterKind,
    ParameterSpec, PortSpec, TriggerContext, TriggerNode, TriggerResponse, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::items::items_from_value;

/// Trigger that only fires when invoked by hand
pub struct ManualTrigger;

#[async_trait]
impl TriggerNode for ManualTrigger {
    async fn trigger(&self, ctx: &TriggerContext) -> Result<TriggerResponse, NodeError> {
        let payload = ctx.get_parameter("items", Value::Null);
        Ok(TriggerResponse::new().with_manual(move || {
            let items = items_from_value(payload.clone());
            Box::pin(async move { Ok(items) })
        }))
    }
}

/// Trigger that emits a tick item every `interval_ms`
pub struct IntervalTrigger;

fn tick_item(tick: u64) -> Item {
    let mut fields = HashMap::new();
    fields.insert("tick".to_string(), Value::Number(tick as f64));
    fields.insert(
        "timestamp".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    Item::new(fields)
}

#[async_trait]
impl TriggerNode for IntervalTrigger {
    async fn trigger(&self, ctx: &TriggerContext) -> Result<TriggerResponse, NodeError> {
        let interval_ms = ctx.get_parameter("interval_ms", 60_000i64).as_f64().unwrap_or(0.0);
        if !interval_ms.is_finite() || interval_ms < 1.0 {
            return Err(NodeError::Configuration(format!(
                "interval_ms must be a finite number of at least 1, got {}",
                interval_ms
            )));
        }
        let interval = Duration::try_from_secs_f64(interval_ms / 1000.0)
            .map_err(|e| NodeError::Configuration(format!("interval_ms out of range: {}", e)))?;

        let counter = Arc::new(AtomicU64::new(0));
        let manual_counter = Arc::clone(&counter);
        let mut response = TriggerResponse::new().with_manual(move || {
            let tick = manual_counter.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move { Ok(vec![tick_item(tick)]) })
        });

        // A manual test activation never schedules anything.
        if ctx.mode != ActivationMode::Manual {
            response = response.with_schedule(interval, move |emitter| {
                let tick = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Box::pin(async move {
                    emitter.emit(vec![tick_item(tick)]);
                    Ok(())
                })
            });
        }

        ctx.events.info(format!("Interval trigger armed every {}ms", interval.as_millis()));
        Ok(response)
    }
}

pub fn manual_descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::trigger(
        NodeTypeDescription::new("trigger.manual", 1u32)
            .with_display_name("Manual Trigger")
            .with_description("Starts a run when invoked by hand")
            .with_category("trigger")
            .with_output(PortSpec::main("Output"))
            .with_parameter(ParameterSpec::new("items", ParameterKind::Json)),
        ManualTrigger,
    )
}

pub fn interval_descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::trigger(
        NodeTypeDescription::new("trigger.interval", 1u32)
            .with_display_name("Interval")
            .with_description("Starts a run on a fixed interval")
            .with_category("trigger")
            .with_output(PortSpec::main("Output"))
            .with_parameter(
                ParameterSpec::new("interval_ms", ParameterKind::Number)
                    .with_default(60_000i64)
                    .required(),
            ),
        IntervalTrigger,
    )
}
