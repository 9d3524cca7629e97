use filament_types::BaseId;

/// URL construction for the two object endpoints.
#[derive(Clone, Debug)]
pub struct Endpoints {
    base_url: String,
    stream_id: String,
}

impl Endpoints {
    pub fn new(base_url: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            stream_id: stream_id.into(),
        }
    }

    /// Batched closure fetch: `POST {base}/api/getobjects/{stream}`.
    pub fn batch_url(&self) -> String {
        format!("{}/api/getobjects/{}", self.base_url, self.stream_id)
    }

    /// Single object fetch: `GET {base}/objects/{stream}/{id}/single`.
    pub fn single_url(&self, id: &BaseId) -> String {
        format!("{}/objects/{}/{}/single", self.base_url, self.stream_id, id)
    }
}
