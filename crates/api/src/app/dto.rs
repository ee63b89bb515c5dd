use serde::Deserialize;

pub const DEFAULT_STATUS_LIMIT: usize = 20;
pub const MAX_STATUS_LIMIT: usize = 200;

/// `GET /jobs/status?limit=`
#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub limit: Option<usize>,
}

impl StatusQuery {
    /// Requested list size, clamped to `1..=MAX_STATUS_LIMIT`.
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_STATUS_LIMIT)
            .clamp(1, MAX_STATUS_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped() {
        assert_eq!(StatusQuery::default().limit(), DEFAULT_STATUS_LIMIT);
        assert_eq!(StatusQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(StatusQuery { limit: Some(10_000) }.limit(), MAX_STATUS_LIMIT);
    }
}
