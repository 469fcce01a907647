//! Telemetry bootstrap for flowmesh nodes.
//!
//! Sets up the `tracing` subscriber and the OpenTelemetry tracer and meter
//! providers. The providers live as long as the returned [`Telemetry`]
//! handle and are flushed when it drops.

use crate::config::parse_bool;
use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const ATTR_SERVICE_INSTANCE_ID: &str = "service.instance.id";
const ATTR_FLOWMESH_RUN_ID: &str = "flowmesh.run_id";
const SERVICE_NAMESPACE: &str = "flowmesh";
const OTEL_PROTOCOL_GRPC: &str = "grpc";
const OTEL_PROTOCOL_HTTP_PROTOBUF: &str = "http/protobuf";

/// Whether spans and metrics leave the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    Disabled,
    Otlp,
}

impl TelemetryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryMode::Disabled => "disabled",
            TelemetryMode::Otlp => "otlp",
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(Error::Config(format!(
                "FLOWMESH_LOG_FORMAT must be one of [json, pretty], got '{other}'"
            ))),
        }
    }
}

/// Telemetry settings read from the environment
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub service_name: String,
    pub node_id: String,
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
    pub otlp_protocol: String,
    pub traces_sampler: String,
    pub run_id: Option<String>,
    pub resource_attributes: Vec<KeyValue>,
    sampler: Sampler,
}

impl TelemetryConfig {
    /// Environment variables:
    /// - OTEL_SERVICE_NAME (default: `default_service_name`)
    /// - OTEL_EXPORTER_OTLP_ENDPOINT (enables export when set)
    /// - OTEL_EXPORTER_OTLP_PROTOCOL: "grpc" (default) or "http/protobuf"
    /// - OTEL_TRACES_SAMPLER / OTEL_TRACES_SAMPLER_ARG
    /// - OTEL_RESOURCE_ATTRIBUTES (`key=value,...`)
    /// - FLOWMESH_TELEMETRY_ENABLED (forces export on or off)
    /// - FLOWMESH_TELEMETRY_RUN_ID
    /// - FLOWMESH_LOG_FORMAT: "json" (default) or "pretty"
    pub fn from_env(default_service_name: &str, node_id: &str) -> Result<Self> {
        Self::from_lookup(default_service_name, node_id, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(default_service_name: &str, node_id: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let service_name = match lookup("OTEL_SERVICE_NAME") {
            Some(name) if name.trim().is_empty() => {
                return Err(Error::Config("OTEL_SERVICE_NAME cannot be empty".to_string()))
            }
            Some(name) => name.trim().to_string(),
            None => default_service_name.to_string(),
        };

        let otlp_endpoint = non_empty("OTEL_EXPORTER_OTLP_ENDPOINT");
        let otlp_protocol = parse_otlp_protocol(
            &non_empty("OTEL_EXPORTER_OTLP_PROTOCOL")
                .unwrap_or_else(|| OTEL_PROTOCOL_GRPC.to_string()),
        )?;
        let mode = match (
            parse_bool("FLOWMESH_TELEMETRY_ENABLED", lookup("FLOWMESH_TELEMETRY_ENABLED"))?,
            otlp_endpoint.is_some(),
        ) {
            (Some(false), _) | (None, false) => TelemetryMode::Disabled,
            (Some(true), true) | (None, true) => TelemetryMode::Otlp,
            (Some(true), false) => {
                return Err(Error::Config(
                    "FLOWMESH_TELEMETRY_ENABLED=true requires OTEL_EXPORTER_OTLP_ENDPOINT"
                        .to_string(),
                ));
            }
        };

        let log_format = match non_empty("FLOWMESH_LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::Json,
        };

        let run_id = non_empty("FLOWMESH_TELEMETRY_RUN_ID");

        let traces_sampler = non_empty("OTEL_TRACES_SAMPLER")
            .unwrap_or_else(|| "parentbased_always_on".to_string());
        let sampler = parse_sampler(&traces_sampler, lookup("OTEL_TRACES_SAMPLER_ARG").as_deref())?;

        // Explicit settings win over OTEL_RESOURCE_ATTRIBUTES, except the namespace
        let mut attributes: BTreeMap<String, String> = match lookup("OTEL_RESOURCE_ATTRIBUTES") {
            Some(raw) => parse_resource_attributes(&raw)?.into_iter().collect(),
            None => BTreeMap::new(),
        };
        attributes.insert(ATTR_SERVICE_NAME.to_string(), service_name.clone());
        attributes.insert(ATTR_SERVICE_INSTANCE_ID.to_string(), node_id.to_string());
        attributes
            .entry(ATTR_SERVICE_NAMESPACE.to_string())
            .or_insert_with(|| SERVICE_NAMESPACE.to_string());
        if let Some(run_id) = &run_id {
            attributes.insert(ATTR_FLOWMESH_RUN_ID.to_string(), run_id.clone());
        }

        Ok(Self {
            mode,
            service_name,
            node_id: node_id.to_string(),
            log_format,
            otlp_endpoint,
            otlp_protocol: otlp_protocol.to_string(),
            traces_sampler,
            run_id,
            resource_attributes: attributes
                .into_iter()
                .map(|(k, v)| KeyValue::new(k, v))
                .collect(),
            sampler,
        })
    }
}

/// Keeps the telemetry providers alive for the lifetime of a node process
pub struct Telemetry {
    config: TelemetryConfig,
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// Install the global subscriber and OTel providers for one node.
    ///
    /// `RUST_LOG` takes precedence over `log_level` when set.
    pub fn init_for_node(
        default_service_name: &str,
        node_id: &str,
        log_level: &str,
    ) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name, node_id)?;
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(log_level.trim()).map_err(|e| {
                Error::Config(format!("invalid log level '{log_level}': {e}"))
            })?,
        };

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true);
        let installed = match config.log_format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Pretty => builder.pretty().try_init(),
        };
        installed.map_err(|e| {
            Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
        })?;

        let resource =
            Resource::default().merge(&Resource::new(config.resource_attributes.clone()));

        let tracer_provider = TracerProvider::builder()
            .with_config(
                trace::Config::default()
                    .with_sampler(config.sampler.clone())
                    .with_resource(resource.clone()),
            )
            .build();
        let _ = global::set_tracer_provider(tracer_provider.clone());

        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        global::set_meter_provider(meter_provider.clone());
        global::set_text_map_propagator(TraceContextPropagator::new());

        info!(
            service_name = %config.service_name,
            node_id = %config.node_id,
            telemetry_mode = config.mode.as_str(),
            otlp_endpoint = %config.otlp_endpoint.as_deref().unwrap_or("none"),
            otlp_protocol = %config.otlp_protocol,
            traces_sampler = %config.traces_sampler,
            run_id = %config.run_id.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );

        Ok(Self {
            config,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn mode(&self) -> TelemetryMode {
        self.config.mode
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.meter_provider.shutdown();
        let _ = self.tracer_provider.shutdown();
    }
}

fn parse_otlp_protocol(raw: &str) -> Result<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        OTEL_PROTOCOL_GRPC => Ok(OTEL_PROTOCOL_GRPC),
        OTEL_PROTOCOL_HTTP_PROTOBUF | "http/proto" => Ok(OTEL_PROTOCOL_HTTP_PROTOBUF),
        other => Err(Error::Config(format!(
            "OTEL_EXPORTER_OTLP_PROTOCOL must be grpc or http/protobuf, got '{other}'"
        ))),
    }
}

fn parse_sampler(name: &str, arg: Option<&str>) -> Result<Sampler> {
    let (parent_based, base) = match name.trim().to_ascii_lowercase().strip_prefix("parentbased_") {
        Some(rest) => (true, rest.to_string()),
        None => (false, name.trim().to_ascii_lowercase()),
    };

    let sampler = match base.as_str() {
        "always_on" => Sampler::AlwaysOn,
        "always_off" => Sampler::AlwaysOff,
        "traceidratio" => Sampler::TraceIdRatioBased(parse_ratio(arg)?),
        _ => {
            return Err(Error::Config(format!(
                "OTEL_TRACES_SAMPLER '{name}' is not supported; expected \
                 [parentbased_]always_on, [parentbased_]always_off or \
                 [parentbased_]traceidratio"
            )))
        }
    };

    Ok(if parent_based {
        Sampler::ParentBased(Box::new(sampler))
    } else {
        sampler
    })
}

fn parse_ratio(arg: Option<&str>) -> Result<f64> {
    let raw = arg.ok_or_else(|| {
        Error::Config("OTEL_TRACES_SAMPLER_ARG is required for ratio samplers".to_string())
    })?;
    match raw.trim().parse::<f64>() {
        Ok(value) if (0.0..=1.0).contains(&value) => Ok(value),
        _ => Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER_ARG must be a number in [0,1], got '{raw}'"
        ))),
    }
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is invalid, expected key=value"
            ))),
        })
        .collect()
}
