use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub reservations_total: IntCounterVec,
    pub status_transitions_total: IntCounterVec,
    pub proof_verifications_total: IntCounterVec,
    pub pending_reservations: IntGauge,
    pub telemetry_samples_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let reservations_total = IntCounterVec::new(
            Opts::new("reservations_total", "Reservation operations by outcome"),
            &["outcome"],
        )
        .expect("valid reservations_total metric");

        let status_transitions_total = IntCounterVec::new(
            Opts::new(
                "status_transitions_total",
                "Accepted sub-order transitions by target status",
            ),
            &["status"],
        )
        .expect("valid status_transitions_total metric");

        let proof_verifications_total = IntCounterVec::new(
            Opts::new(
                "proof_verifications_total",
                "Proof-of-delivery verification attempts by outcome",
            ),
            &["outcome"],
        )
        .expect("valid proof_verifications_total metric");

        let pending_reservations = IntGauge::new(
            "pending_reservations",
            "Reservations parked waiting for an idle unit",
        )
        .expect("valid pending_reservations metric");

        let telemetry_samples_total = IntCounterVec::new(
            Opts::new("telemetry_samples_total", "Ingested telemetry samples"),
            &["freshness"],
        )
        .expect("valid telemetry_samples_total metric");

        registry
            .register(Box::new(reservations_total.clone()))
            .expect("register reservations_total");
        registry
            .register(Box::new(status_transitions_total.clone()))
            .expect("register status_transitions_total");
        registry
            .register(Box::new(proof_verifications_total.clone()))
            .expect("register proof_verifications_total");
        registry
            .register(Box::new(pending_reservations.clone()))
            .expect("register pending_reservations");
        registry
            .register(Box::new(telemetry_samples_total.clone()))
            .expect("register telemetry_samples_total");

        Self {
            registry,
            reservations_total,
            status_transitions_total,
            proof_verifications_total,
            pending_reservations,
            telemetry_samples_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
