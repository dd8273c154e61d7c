//! Integrated Prometheus metrics exporter.
//!
//! Reservation and circuit counts live in the process-wide Prometheus
//! registry; the relay's event handler updates them and the `/metrics`
//! route exposes whatever the registry has gathered.

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntGauge, TextEncoder, register_int_counter, register_int_gauge,
};

pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::default);

pub struct Metrics {
    /// Reservations currently held by peers.
    pub reservations: IntGauge,
    /// Circuits currently being spliced.
    pub circuits: IntGauge,
    pub reservations_total: IntCounter,
    pub circuits_total: IntCounter,
    pub circuits_denied_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Unable to initialize Prometheus metrics data!")
    }
}

impl Metrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            reservations: register_int_gauge!(
                "relay_reservations",
                "The number of live reservations"
            )?,
            circuits: register_int_gauge!("relay_circuits", "The number of open circuits")?,
            reservations_total: register_int_counter!(
                "relay_reservations_total",
                "The total amount of accepted reservations"
            )?,
            circuits_total: register_int_counter!(
                "relay_circuits_total",
                "The total amount of accepted circuits"
            )?,
            circuits_denied_total: register_int_counter!(
                "relay_circuits_denied_total",
                "The total amount of denied circuits"
            )?,
        })
    }
}

/// Generate prometheus metrics data that externally needs to be exposed
/// to the `/metrics` route.
pub fn generate_metrics(buf: &mut Vec<u8>) -> Result<()> {
    TextEncoder::new().encode(&prometheus::gather(), buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_show_up_in_the_gather_output() {
        METRICS.reservations.inc();
        METRICS.circuits_total.inc();

        let mut buf = Vec::with_capacity(4096);
        generate_metrics(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("relay_reservations"));
        assert!(text.contains("relay_circuits_total"));

        METRICS.reservations.dec();
    }
}
