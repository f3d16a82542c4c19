use std::sync::Arc;

use portal_core::{
    Phase, PluginDescriptor, PortalError, QueryAction, QueryRequest, RawPage, Session,
};
use portal_logging::{portal_debug, portal_info};

use crate::auth::page_failure;
use crate::page::{first_match, FormField, PageError, PageSession, PageSessionFactory};

/// Runs one query on a fresh page seeded with the session state.
pub struct QueryExecutor {
    factory: Arc<dyn PageSessionFactory>,
}

impl QueryExecutor {
    pub fn new(factory: Arc<dyn PageSessionFactory>) -> Self {
        Self { factory }
    }

    /// Raw records for `request`.
    ///
    /// An empty result set comes back as a page with `empty` set. A page that
    /// matches the descriptor's logged-out predicate fails with
    /// `SessionExpiredDuringQuery`.
    pub async fn execute(
        &self,
        descriptor: &PluginDescriptor,
        session: &Session,
        request: &QueryRequest,
    ) -> Result<RawPage, PortalError> {
        let plugin_id = descriptor.id.as_str();
        let state = (!session.state.is_empty()).then_some(&session.state);
        let mut page = self
            .factory
            .open(descriptor, state)
            .await
            .map_err(|err| page_failure(plugin_id, Phase::Query, err))?;
        let result = run(page.as_mut(), descriptor, request).await;
        page.close().await;
        result
    }
}

async fn run(
    page: &mut dyn PageSession,
    descriptor: &PluginDescriptor,
    request: &QueryRequest,
) -> Result<RawPage, PortalError> {
    let plugin_id = descriptor.id.as_str();
    let fail = |err: PageError| page_failure(plugin_id, Phase::Query, err);
    let target = descriptor.query_target(request.query());

    page.navigate(&target).await.map_err(fail)?;
    ensure_logged_in(page, descriptor).await?;

    if let QueryAction::SearchForm { input_selector } = &descriptor.query {
        page.fill_form(&[FormField::new(input_selector, request.query())])
            .await
            .map_err(fail)?;
        page.submit().await.map_err(fail)?;
        ensure_logged_in(page, descriptor).await?;
    }

    let source_url = page.current_url().unwrap_or(target);
    let rules = &descriptor.extraction;

    if let Some(indicator) = first_match(page, &rules.no_results).await.map_err(fail)? {
        portal_info!("{} reported no results ({:?})", plugin_id, indicator);
        return Ok(RawPage {
            source_url,
            nodes: Vec::new(),
            page_text: String::new(),
            empty: true,
        });
    }

    let nodes = page.extract_dom(&rules.selectors()).await.map_err(fail)?;
    let page_text = page.page_text(&rules.raw_text).await.map_err(fail)?;
    let empty = nodes.is_empty() && page_text.trim().is_empty();
    portal_debug!(
        "{}: extracted {} nodes, {} chars of text from {}",
        plugin_id,
        nodes.len(),
        page_text.len(),
        source_url
    );

    Ok(RawPage {
        source_url,
        nodes,
        page_text,
        empty,
    })
}

async fn ensure_logged_in(
    page: &mut dyn PageSession,
    descriptor: &PluginDescriptor,
) -> Result<(), PortalError> {
    let matched = first_match(page, &descriptor.logged_out)
        .await
        .map_err(|err| page_failure(&descriptor.id, Phase::Query, err))?;
    match matched {
        Some(indicator) => {
            portal_info!(
                "{} answered with a logged-out page ({:?})",
                descriptor.id,
                indicator
            );
            Err(PortalError::SessionExpiredDuringQuery {
                plugin_id: descriptor.id.clone(),
            })
        }
        None => Ok(()),
    }
}
