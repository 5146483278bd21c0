use anyhow::Result;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use workbook_mcp::state::compute_file_checksum;
use workbook_mcp::tools::{
    self, BuildNavigationMapParams, OptimizationHints, QueryDataParams, WindowConfig,
};

mod support;

async fn navigation_json(
    state: Arc<workbook_mcp::state::AppState>,
    path: &Path,
) -> Result<(Value, String)> {
    let checksum = compute_file_checksum(path)?;
    let response = tools::build_navigation_map(
        state,
        BuildNavigationMapParams {
            filepath: path.to_string_lossy().into_owned(),
            checksum: checksum.clone(),
            chunk_cursor: None,
            window_size: 1000,
            stream_results: false,
            token_config: None,
        },
    )
    .await?;
    Ok((serde_json::to_value(&response.navigation_index)?, checksum))
}

fn query_params(query: &str, navigation_index: Value, path: &Path) -> QueryDataParams {
    QueryDataParams {
        query: query.to_string(),
        navigation_index,
        continuation_cursor: None,
        window_config: WindowConfig::default(),
        token_aware: true,
        optimization_hints: OptimizationHints::default(),
        filepath: Some(path.to_string_lossy().into_owned()),
        checksum: None,
    }
}

#[tokio::test]
async fn numeric_range_queries_use_the_btree_index() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = support::sales_workbook(&workspace, "ventes.xlsx");

    let state = support::app_state();
    let (nav, _) = navigation_json(state.clone(), &path).await?;

    let response =
        tools::query_data(state, query_params("value >= 1000", nav, &path)).await?;

    assert!(response.query_execution.used_index);
    assert_eq!(response.query_execution.index_type, "btree");
    assert_eq!(response.query_execution.strategy, "index");
    assert!(response.query_execution.bloom_filter_used);

    // 1500 and 2750.5 clear the bound; 980 and the margins do not.
    let locations: Vec<&str> = response
        .results
        .data
        .iter()
        .map(|chunk| chunk.location.as_str())
        .collect();
    assert_eq!(locations, vec!["Ventes!B2", "Ventes!B3"]);
    for chunk in &response.results.data {
        let value = chunk.data_chunk.as_f64().expect("numeric value");
        assert!(value >= 1000.0);
    }
    Ok(())
}

#[tokio::test]
async fn text_queries_on_small_maps_scan_rows() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = support::sales_workbook(&workspace, "ventes.xlsx");

    let state = support::app_state();
    let (nav, _) = navigation_json(state.clone(), &path).await?;

    let response = tools::query_data(state, query_params("Boucherie", nav, &path)).await?;

    assert_eq!(response.query_execution.strategy, "scan");
    assert!(!response.query_execution.used_index);
    assert_eq!(response.query_execution.chunks_scanned, vec!["sheet_0"]);

    assert_eq!(response.results.data.len(), 1);
    let chunk = &response.results.data[0];
    assert_eq!(chunk.location, "Ventes!A2");
    assert_eq!(chunk.context.headers[0], "Rayons");
    assert_eq!(chunk.data_chunk[0], serde_json::json!("Boucherie"));
    Ok(())
}

#[tokio::test]
async fn sheet_name_match_on_wide_maps_goes_hybrid() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = workspace.write_stub("magasins.xlsm", b"many-sheets");

    let reader = Arc::new(support::FakeWorkbookReader::new());
    let mut sheets: Vec<(String, Vec<Vec<String>>)> = vec![(
        "FROUDIS".to_string(),
        vec![
            vec!["Rayons".to_string(), "Ventes_HT".to_string()],
            vec!["Boucherie".to_string(), "1500".to_string()],
        ],
    )];
    for i in 0..14 {
        sheets.push((format!("Magasin{i:02}"), vec![vec![format!("Magasin{i:02}")]]));
    }
    reader.register(&path, sheets);

    let state = support::app_state_with_reader(reader);
    let (nav, _) = navigation_json(state.clone(), &path).await?;

    let mut params = query_params("FROUDIS", nav, &path);
    params.window_config.max_results = 1;
    let response = tools::query_data(state, params).await?;

    assert_eq!(response.query_execution.strategy, "hybrid");
    assert!(response.query_execution.used_index);
    assert!(response.query_execution.bloom_filter_used);

    assert!(!response.results.data.is_empty());
    assert!(
        response
            .results
            .data
            .iter()
            .any(|chunk| chunk.location.starts_with("FROUDIS!"))
    );

    // max_results was hit, so a continuation cursor is emitted.
    assert!(!response.pagination.next_cursor.is_empty());
    Ok(())
}

#[tokio::test]
async fn adaptive_response_offers_per_model_strategies() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = support::sales_workbook(&workspace, "ventes.xlsx");

    let state = support::app_state();
    let (nav, _) = navigation_json(state.clone(), &path).await?;

    let response = tools::query_data(state, query_params("Fromage", nav, &path)).await?;

    let adaptive = &response.adaptive_response;
    assert_eq!(adaptive.model_context.detected, "standard");
    assert_eq!(adaptive.model_context.limit, 200_000);
    assert_eq!(adaptive.if_extended.max_results, 500);
    assert_eq!(adaptive.if_extended.compression, "light");
    assert_eq!(adaptive.if_standard.window_rows, 1000);
    assert_eq!(adaptive.if_precise.compression, "aggressive");
    Ok(())
}

#[tokio::test]
async fn token_aware_off_skips_adaptive_shaping() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = support::sales_workbook(&workspace, "ventes.xlsx");

    let state = support::app_state();
    let (nav, _) = navigation_json(state.clone(), &path).await?;

    let mut params = query_params("Fromage", nav, &path);
    params.token_aware = false;
    let response = tools::query_data(state, params).await?;

    assert!(response.adaptive_response.model_context.detected.is_empty());
    Ok(())
}

#[tokio::test]
async fn aggregation_and_volume_hints_are_reported() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = support::sales_workbook(&workspace, "ventes.xlsx");

    let state = support::app_state();
    let (nav, _) = navigation_json(state.clone(), &path).await?;

    let response = tools::query_data(
        state,
        query_params("SUM of Ventes_HT", nav, &path),
    )
    .await?;

    assert!(
        response
            .index_updates
            .new_patterns
            .contains(&"aggregation_query".to_string())
    );
    assert!(!response.index_updates.delta_applied);
    Ok(())
}

#[tokio::test]
async fn continuation_pages_past_delivered_results() -> Result<()> {
    let workspace = support::TestWorkspace::new();
    let path = support::sales_workbook(&workspace, "ventes.xlsx");

    let state = support::app_state();
    let (nav, _) = navigation_json(state.clone(), &path).await?;

    // "o" hits the header row plus two data rows, but not the sheet name.
    let mut params = query_params("o", nav.clone(), &path);
    params.window_config.max_results = 2;
    let first = tools::query_data(state.clone(), params.clone()).await?;
    assert_eq!(first.results.data.len(), 2);
    assert!(!first.pagination.next_cursor.is_empty());

    params.continuation_cursor = Some(first.pagination.next_cursor.clone());
    let second = tools::query_data(state, params).await?;
    assert!(!second.results.data.is_empty());
    assert_ne!(
        first.results.data[0].location,
        second.results.data[0].location
    );
    Ok(())
}
