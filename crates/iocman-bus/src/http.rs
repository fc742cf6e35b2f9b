//! ---
//! iocman_section: "03-control-point-bus"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Control-point bus, point API and liveness probing."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::point::Point;
use crate::{BusError, PointReader, Result};

/// Reads points from a remote gateway exposing the point API
/// (`GET {base}/api/points/{name}`).
#[derive(Clone)]
pub struct HttpPointReader {
    client: reqwest::Client,
    base: Url,
}

impl HttpPointReader {
    /// Create a reader for the gateway at `base`.
    pub fn new(base: Url) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, base })
    }

    fn point_url(&self, name: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BusError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["api", "points", name]);
        Ok(url)
    }
}

#[async_trait]
impl PointReader for HttpPointReader {
    async fn read(&self, name: &str) -> Result<Option<Point>> {
        let response = self.client.get(self.point_url(name)?).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<Point>().await?)),
            status => Err(BusError::Status {
                name: name.to_owned(),
                status: status.as_u16(),
            }),
        }
    }

    fn describe(&self) -> String {
        self.base.to_string()
    }
}
