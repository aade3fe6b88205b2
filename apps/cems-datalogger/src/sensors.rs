mod modbus;
mod page;
mod types;

pub use types::{SensorDescriptor, SensorReadings, SensorSource, SerialBusConfig};
#[cfg(test)]
pub use types::{DataType, Endianness, ModbusRegister, PageSensor, RegisterType, SensorValue};

use crate::reporter::{ErrorReporter, ReportTag};
use anyhow::Result;
use reqwest::Client;
use std::sync::Arc;

/// Fans a fetch out over every configured source and merges the results.
#[derive(Clone)]
pub struct SensorFetcher {
    client: Client,
    datapage_url: Option<String>,
    reporter: Option<Arc<ErrorReporter>>,
}

impl SensorFetcher {
    pub fn new(datapage_url: Option<String>, reporter: Option<Arc<ErrorReporter>>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            datapage_url,
            reporter,
        })
    }

    pub async fn fetch_all_sensors(
        &self,
        sensors: &[SensorDescriptor],
        bus: Option<&SerialBusConfig>,
    ) -> SensorReadings {
        let mut page_sensors = Vec::new();
        let mut tcp_sensors = Vec::new();
        let mut rtu_sensors = Vec::new();
        for sensor in sensors {
            match sensor.source {
                SensorSource::PageScrape(_) => page_sensors.push(sensor),
                SensorSource::ModbusTcp(_) => tcp_sensors.push(sensor),
                SensorSource::ModbusRtu(_) => rtu_sensors.push(sensor),
            }
        }

        let mut readings = SensorReadings::new();

        if !page_sensors.is_empty() {
            match self.datapage_url.as_deref() {
                Some(url) => readings.extend(self.fetch_page_sensors(url, &page_sensors).await),
                None => tracing::debug!(count = page_sensors.len(), "no datapage url; page sensors skipped"),
            }
        }

        if !tcp_sensors.is_empty() {
            readings.extend(modbus::fetch_tcp_sensors(&tcp_sensors).await);
        }

        if !rtu_sensors.is_empty() {
            match bus {
                Some(bus) => readings.extend(modbus::fetch_rtu_sensors(bus, &rtu_sensors).await),
                None => tracing::warn!(count = rtu_sensors.len(), "no rtu_device configured; rtu sensors skipped"),
            }
        }

        readings
    }

    async fn fetch_page_sensors(&self, url: &str, sensors: &[&SensorDescriptor]) -> SensorReadings {
        match page::load_page(&self.client, url).await {
            Ok(html) => page::parse_page(&html, sensors),
            Err(err) => {
                tracing::error!(url, error = %err, "datapage fetch failed");
                if let Some(reporter) = &self.reporter {
                    reporter.spawn_report(ReportTag::FetchError, err.to_string());
                }
                SensorReadings::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page_sensor(sensor_id: &str, param: &str) -> SensorDescriptor {
        SensorDescriptor {
            param_name: param.to_string(),
            unit: String::new(),
            source: SensorSource::PageScrape(PageSensor {
                sensor_id: sensor_id.to_string(),
            }),
        }
    }

    fn rtu_sensor(param: &str) -> SensorDescriptor {
        SensorDescriptor {
            param_name: param.to_string(),
            unit: String::new(),
            source: SensorSource::ModbusRtu(ModbusRegister {
                slave_id: 2,
                register_type: RegisterType::Input,
                register_address: 10,
                data_type: DataType::Int16,
                byte_order: Endianness::Big,
                word_order: Endianness::Big,
            }),
        }
    }

    #[tokio::test]
    async fn page_sources_merge_and_rtu_without_bus_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<table><tr class="EvenRow"><td id="SID7">S07</td><td id="MVAL7">3.5</td><td id="MUNIT7">%</td></tr></table>"#,
            ))
            .mount(&server)
            .await;

        let fetcher = SensorFetcher::new(Some(format!("{}/status", server.uri())), None).unwrap();
        let sensors = vec![page_sensor("S07", "O2"), rtu_sensor("temp")];
        let readings = fetcher.fetch_all_sensors(&sensors, None).await;

        assert_eq!(readings.len(), 1);
        assert_eq!(readings["O2"], SensorValue::new("3.5", "%"));
    }

    #[tokio::test]
    async fn page_sensors_skipped_without_datapage_url() {
        let fetcher = SensorFetcher::new(None, None).unwrap();
        let readings = fetcher
            .fetch_all_sensors(&[page_sensor("S01", "pH")], None)
            .await;
        assert!(readings.is_empty());
    }

    #[tokio::test]
    async fn page_failure_yields_empty_map() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let fetcher = SensorFetcher::new(Some(server.uri()), None).unwrap();
        let readings = fetcher
            .fetch_all_sensors(&[page_sensor("S01", "pH")], None)
            .await;
        assert!(readings.is_empty());
    }
}
