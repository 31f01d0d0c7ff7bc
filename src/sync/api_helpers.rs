use crate::error::Result;
use crate::mapper::schema;
use crate::notion::{Block, Filter, Page, QueryRequest, Workspace};
use crate::sync::rate_limit::retry_api;

/// Safety valve against a server that keeps returning `has_more` forever.
const MAX_PAGES: usize = 10_000;

/// Run a database query to exhaustion, following `next_cursor`.
///
/// Pages are concatenated in the order the server returned them.
pub async fn query_all(
    workspace: &dyn Workspace,
    database_id: &str,
    request: &QueryRequest,
) -> Result<Vec<Page>> {
    let mut results = Vec::new();
    let mut cursor: Option<String> = None;

    for page_no in 0..MAX_PAGES {
        let req = request.with_cursor(cursor.take());
        let page = retry_api!(workspace.query(database_id, &req))?;
        log::debug!(
            "{database_id}: page {} returned {} rows (has_more={})",
            page_no + 1,
            page.results.len(),
            page.has_more
        );
        results.extend(page.results);

        match (page.has_more, page.next_cursor) {
            (true, Some(next)) => cursor = Some(next),
            (true, None) => {
                log::warn!("{database_id}: has_more without next_cursor, stopping");
                break;
            }
            (false, _) => break,
        }
    }
    Ok(results)
}

/// All child blocks of a page, following `next_cursor`.
pub async fn list_all_children(workspace: &dyn Workspace, block_id: &str) -> Result<Vec<Block>> {
    let mut blocks = Vec::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_PAGES {
        let page = retry_api!(workspace.list_children(block_id, cursor.as_deref()))?;
        blocks.extend(page.results);
        match (page.has_more, page.next_cursor) {
            (true, Some(next)) => cursor = Some(next),
            _ => break,
        }
    }
    Ok(blocks)
}

/// Find the mirror workers-database row linked to a workspace user.
pub async fn find_worker(
    workspace: &dyn Workspace,
    workers_db_id: &str,
    person_id: &str,
) -> Result<Option<String>> {
    let req = QueryRequest::new()
        .filter(Filter::people_contains(schema::mirror::WORKER_PERSON, person_id))
        .page_size(1);
    let page = retry_api!(workspace.query(workers_db_id, &req))?;
    Ok(page.results.into_iter().next().map(|p| p.id))
}
