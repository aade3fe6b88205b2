use super::types::{SensorDescriptor, SensorReadings, SensorSource, SensorValue};
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub const PAGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("HTTP {status}: {url}")]
    Status { status: u16, url: String },
    #[error("cannot read {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub async fn load_page(client: &Client, url: &str) -> Result<String, ScrapeError> {
    if let Some(path) = url.strip_prefix("file://") {
        return tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ScrapeError::File {
                path: path.to_string(),
                source,
            });
    }

    let response = client
        .get(url)
        .timeout(PAGE_TIMEOUT)
        .send()
        .await
        .map_err(ScrapeError::Network)?;
    if !response.status().is_success() {
        return Err(ScrapeError::Status {
            status: response.status().as_u16(),
            url: url.to_string(),
        });
    }
    response.text().await.map_err(ScrapeError::Network)
}

/// Extract configured sensors from the instrument status page.
///
/// Only `<tr class="EvenRow|OddRow">` rows whose `SID*` cell names a
/// configured sensor are read. The configured unit wins over the page unit.
pub fn parse_page(html: &str, sensors: &[&SensorDescriptor]) -> SensorReadings {
    let wanted: HashMap<&str, &SensorDescriptor> = sensors
        .iter()
        .filter_map(|sensor| match &sensor.source {
            SensorSource::PageScrape(page) => Some((page.sensor_id.trim(), *sensor)),
            _ => None,
        })
        .collect();

    let mut readings = SensorReadings::new();
    let (Ok(rows), Ok(cells)) = (
        Selector::parse("tr.EvenRow, tr.OddRow"),
        Selector::parse("td[id]"),
    ) else {
        return readings;
    };

    let document = Html::parse_document(html);
    for row in document.select(&rows) {
        let mut by_id: HashMap<&str, String> = HashMap::new();
        let mut sid_cell: Option<(&str, String)> = None;
        for cell in row.select(&cells) {
            let Some(id) = cell.value().id() else {
                continue;
            };
            let text = cell.text().collect::<String>().trim().to_string();
            if sid_cell.is_none() && id.starts_with("SID") {
                sid_cell = Some((id, text.clone()));
            }
            by_id.insert(id, text);
        }

        let Some((sid_id, sensor_id)) = sid_cell else {
            continue;
        };
        let Some(sensor) = wanted.get(sensor_id.as_str()) else {
            continue;
        };
        let suffix: String = sid_id.chars().filter(|c| c.is_ascii_digit()).collect();
        let Some(raw_value) = by_id.get(format!("MVAL{suffix}").as_str()) else {
            continue;
        };
        let value = match raw_value.parse::<f64>() {
            Ok(value) if value.is_finite() => value,
            _ => {
                tracing::warn!(sensor_id = %sensor_id, raw = %raw_value, "non-numeric page value skipped");
                continue;
            }
        };
        let unit = if sensor.unit.is_empty() {
            by_id
                .get(format!("MUNIT{suffix}").as_str())
                .cloned()
                .unwrap_or_default()
        } else {
            sensor.unit.clone()
        };
        readings.insert(
            sensor.param_name.clone(),
            SensorValue::new(value.to_string(), unit),
        );
    }
    readings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::types::PageSensor;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"
        <html><body><table>
          <tr class="HeaderRow"><td id="SID0">S00</td><td id="MVAL0">1.0</td></tr>
          <tr class="EvenRow"><td id="SID1">S01</td><td id="MVAL1"> 8.2 </td><td id="MUNIT1">pH</td></tr>
          <tr class="OddRow"><td id="SID2">S02</td><td id="MVAL2">----</td><td id="MUNIT2">mg/Nm3</td></tr>
          <tr class="EvenRow"><td id="SID3">S03</td><td id="MVAL3">41.5</td><td id="MUNIT3">mg/Nm3</td></tr>
          <tr class="OddRow"><td id="SID4">S04</td><td id="MVAL4">12</td><td id="MUNIT4">C</td></tr>
        </table></body></html>
    "#;

    fn page_sensor(sensor_id: &str, param: &str, unit: &str) -> SensorDescriptor {
        SensorDescriptor {
            param_name: param.to_string(),
            unit: unit.to_string(),
            source: SensorSource::PageScrape(PageSensor {
                sensor_id: sensor_id.to_string(),
            }),
        }
    }

    #[test]
    fn configured_rows_are_extracted_and_non_numeric_skipped() {
        let ph = page_sensor("S01", "pH", "");
        let dust = page_sensor("S02", "dust", "");
        let so2 = page_sensor("S03", "SO2", "ppm");
        let header = page_sensor("S00", "header", "");
        let readings = parse_page(PAGE, &[&ph, &dust, &so2, &header]);

        assert_eq!(readings.len(), 2);
        assert_eq!(readings["pH"], SensorValue::new("8.2", "pH"));
        assert_eq!(readings["SO2"], SensorValue::new("41.5", "ppm"));
        assert!(!readings.contains_key("dust"));
        assert!(!readings.contains_key("header"));
    }

    #[test]
    fn unconfigured_rows_are_ignored() {
        let readings = parse_page(PAGE, &[]);
        assert!(readings.is_empty());
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = load_page(&Client::new(), &format!("{}/page", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn file_urls_are_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("page.html");
        std::fs::write(&file, PAGE).unwrap();

        let html = load_page(&Client::new(), &format!("file://{}", file.display()))
            .await
            .unwrap();
        let ph = page_sensor("S01", "pH", "");
        assert_eq!(parse_page(&html, &[&ph])["pH"].value, "8.2");
    }
}
