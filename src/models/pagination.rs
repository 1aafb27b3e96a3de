use serde::{Deserialize, Serialize};

pub const MAX_PAGE_SIZE: i64 = 100;
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// Query parameters shared by all list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListParams {
    /// Clamp to the allowed window: limit 1..=100, offset >= 0.
    pub fn clamped(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, total: i64, limit: i64, offset: i64) -> Self {
        Self {
            data,
            pagination: Pagination {
                total,
                limit,
                offset,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_limit_and_offset() {
        let p = ListParams {
            limit: Some(500),
            offset: Some(-3),
        };
        assert_eq!(p.clamped(), (100, 0));

        let p = ListParams {
            limit: Some(0),
            offset: None,
        };
        assert_eq!(p.clamped(), (1, 0));

        let p = ListParams {
            limit: None,
            offset: Some(40),
        };
        assert_eq!(p.clamped(), (DEFAULT_PAGE_SIZE, 40));
    }
}
