use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use rfps_adapters::{load_fixture_page, FixtureTransport};
use rfps_core::parse_search_page;
use rfps_storage::{read_scraping_output, OutputWriter};
use rfps_sync::{PaginationDriver, ScrapePipeline, ScrapeWindow};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/sam-gov")
        .join(name)
}

#[tokio::test]
async fn complex_fixture_round_trips_through_artifact() {
    let bytes = load_fixture_page(fixture_path("search_page_complex.json")).expect("fixture");
    let expected = parse_search_page(&bytes).expect("fixture validates").opportunities_data;

    let dir = tempfile::tempdir().expect("tempdir");
    let driver = PaginationDriver::new(FixtureTransport::new().with_page(0, bytes));
    let pipeline = ScrapePipeline::new(driver, OutputWriter::new(dir.path()));
    let window = ScrapeWindow::new(
        Utc.with_ymd_and_hms(2025, 4, 28, 6, 0, 0).single().unwrap(),
        Utc.with_ymd_and_hms(2025, 4, 29, 6, 0, 0).single().unwrap(),
    );

    let summary = pipeline.run_once(window).await.expect("run");
    assert_eq!(summary.opportunities, expected.len());
    assert!(!summary.persisted);
    assert!(!summary.drift);

    let reread = read_scraping_output(&summary.artifact_path).await.expect("reread");
    assert_eq!(reread, expected);
}

#[tokio::test]
async fn rerunning_the_same_window_overwrites_one_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let window = ScrapeWindow::new(
        Utc.with_ymd_and_hms(2025, 4, 28, 0, 0, 0).single().unwrap(),
        Utc.with_ymd_and_hms(2025, 4, 29, 0, 0, 0).single().unwrap(),
    );

    let mut paths = Vec::new();
    for _ in 0..2 {
        let transport = FixtureTransport::new()
            .with_page_file(0, fixture_path("search_page_basic.json"))
            .expect("fixture");
        let pipeline = ScrapePipeline::new(PaginationDriver::new(transport), OutputWriter::new(dir.path()));
        paths.push(pipeline.run_once(window).await.expect("run").artifact_path);
    }

    assert_eq!(paths[0], paths[1]);
    assert_eq!(std::fs::read_dir(dir.path()).expect("dir").count(), 1);
}
