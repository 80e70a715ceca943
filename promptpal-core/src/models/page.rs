use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: i64 = 20;
pub const MAX_LIMIT: i64 = 100;

/// Keyset pagination: rows with `id < cursor`, newest first.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Pagination {
    pub cursor: Option<i64>,
    pub limit: Option<i64>,
}

impl Pagination {
    pub fn new(cursor: i64, limit: i64) -> Self {
        Self {
            cursor: Some(cursor),
            limit: Some(limit),
        }
    }

    /// Exclusive upper bound on ids. Missing or non-positive means "from the top".
    pub fn cursor(&self) -> i64 {
        match self.cursor {
            Some(c) if c > 0 => c,
            _ => i64::MAX,
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub count: i64,
    pub data: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults() {
        let p = Pagination::default();
        assert_eq!(p.cursor(), i64::MAX);
        assert_eq!(p.limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn test_pagination_clamps_limit() {
        assert_eq!(Pagination::new(10, 0).limit(), 1);
        assert_eq!(Pagination::new(10, 5000).limit(), MAX_LIMIT);
        assert_eq!(Pagination::new(10, 7).limit(), 7);
    }

    #[test]
    fn test_zero_cursor_means_from_the_top() {
        assert_eq!(Pagination::new(0, 10).cursor(), i64::MAX);
        assert_eq!(Pagination::new(42, 10).cursor(), 42);
    }
}
