//! Formatted output helpers for CLI commands.

use corral_runtime::entity::Container;
use corral_runtime::pool::Pool;

/// Header line of [`pool_row`].
#[must_use]
pub fn pool_header() -> String {
    format!("{:<16} {:<10} {:>6} {:>6} {:>11}", "POOL", "STATE", "START", "STOP", "CONTAINERS")
}

/// One pool with its parallelism and container count.
#[must_use]
pub fn pool_row(pool: &Pool, containers: usize) -> String {
    format!(
        "{:<16} {:<10} {:>6} {:>6} {:>11}",
        pool.name(),
        format!("{:?}", pool.state()).to_lowercase(),
        pool.autostart_plan().limit(),
        pool.autostop_plan().limit(),
        containers
    )
}

/// Header line of [`container_row`].
#[must_use]
pub fn container_header() -> String {
    format!("{:<24} {:<12} {:<12} {:<10} {:>9}", "CONTAINER", "USER", "GROUP", "STATE", "AUTOSTART")
}

/// One container with its owner and autostart priority.
#[must_use]
pub fn container_row(ct: &Container) -> String {
    format!(
        "{:<24} {:<12} {:<12} {:<10} {:>9}",
        ct.ident(),
        ct.user().name(),
        ct.group().name(),
        ct.state().as_str(),
        ct.autostart().map_or_else(|| "-".to_owned(), |a| a.priority.to_string())
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use corral_runtime::event::EventBus;
    use corral_runtime::lock::LockManager;

    use super::*;

    #[test]
    fn pool_row_lines_up_with_header() {
        let pool = Pool::new(&LockManager::new(), &EventBus::new(), "tank", 2, 4, Duration::from_secs(60));
        let row = pool_row(&pool, 3);
        assert_eq!(row.len(), pool_header().len());
        assert!(row.starts_with("tank "));
        assert!(row.contains("importing"));
    }
}
