//! Full retrievals against a scripted 3D building service.
//!
//! Every cell serves two pages with different vertex transforms. A building
//! on the cell borders appears on the second page of every cell.

use std::sync::Arc;
use std::time::Duration;

use geofetch_core::test_support::rd_bbox;
use geofetch_core::{AttributeValue, Coord3, DecodedFeature, GeometryValue, ProfileRegistry, Retrieval};
use geofetch_data::test_support::{StubReply, StubTransport};
use geofetch_data::{
    FeatureRetriever, RetrievalConfig, RetrievalRequest, RetryPolicy, ServiceDescriptor,
};
use rstest::{fixture, rstest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

const BORDER_ID: &str = "NL.IMBAG.Pand.0599100000000000";
const BORDER: [i64; 3] = [80_300, 429_300, 5];

fn cell_origin(url: &Url) -> (i64, i64) {
    let (_, bbox) = url
        .query_pairs()
        .find(|(k, _)| k == "bbox")
        .expect("bbox parameter");
    let mut bounds = bbox.split(',').map(|v| v.parse::<f64>().expect("numeric bound"));
    let min_x = bounds.next().expect("min x");
    let min_y = bounds.next().expect("min y");
    // Cell origins are whole metres.
    (min_x as i64, min_y as i64)
}

fn building(id: &str, vertices: &[[i64; 3]]) -> String {
    let vertices: Vec<String> = vertices
        .iter()
        .map(|[x, y, z]| format!("[{x}, {y}, {z}]"))
        .collect();
    format!(
        r#"{{"type": "CityJSONFeature", "id": "{id}",
            "CityObjects": {{"{id}": {{"type": "Building", "attributes": {{"status": "Pand in gebruik"}},
                "geometry": [{{"type": "MultiSurface", "lod": "0", "boundaries": [[[0, 1, 2]]]}}]}}}},
            "vertices": [{}]}}"#,
        vertices.join(", ")
    )
}

/// First page: scale 0.5 from the cell origin, linking to the second page.
fn first_page(url: &Url, (x, y): (i64, i64)) -> String {
    let feature = building(&format!("pand-{x}-{y}-a"), &[[2, 4, 6], [10, 4, 6], [10, 12, 6]]);
    format!(
        r#"{{"type": "FeatureCollection",
            "metadata": {{"transform": {{"scale": [0.5, 0.5, 0.5], "translate": [{x}, {y}, 0]}}}},
            "features": [{feature}],
            "links": [{{"rel": "next", "href": "{url}&page=2"}}]}}"#
    )
}

/// Second page: scale 0.25 from 100 m past the origin, plus the border building.
fn second_page((x, y): (i64, i64)) -> String {
    let (tx, ty, tz) = (x + 100, y + 100, 10);
    let own = building(&format!("pand-{x}-{y}-b"), &[[4, 8, 40], [8, 8, 40], [8, 16, 40]]);
    let [bx, by, bz] = BORDER;
    let corner = [(bx - tx) * 4, (by - ty) * 4, (bz - tz) * 4];
    let border = building(
        BORDER_ID,
        &[corner, [corner[0] + 4, corner[1], corner[2]], [corner[0] + 4, corner[1] + 4, corner[2]]],
    );
    format!(
        r#"{{"type": "FeatureCollection",
            "metadata": {{"transform": {{"scale": [0.25, 0.25, 0.25], "translate": [{tx}, {ty}, {tz}]}}}},
            "features": [{own}, {border}]}}"#
    )
}

fn three_d_bag() -> Arc<StubTransport> {
    Arc::new(StubTransport::from_fn(|url| {
        let origin = cell_origin(url);
        if url.query_pairs().any(|(k, v)| k == "page" && v == "2") {
            StubReply::json(second_page(origin))
        } else {
            StubReply::json(first_page(url, origin))
        }
    }))
}

fn first_vertex(feature: &DecodedFeature) -> Coord3 {
    let GeometryValue::Polygon(surface) = &feature.geometry else {
        panic!("{} should decode to a polygon", feature.id);
    };
    surface[0][0]
}

#[fixture]
fn request() -> RetrievalRequest {
    let bbox = rd_bbox(80_000.0, 429_000.0, 80_600.0, 429_500.0).expect("valid bbox");
    RetrievalRequest::new(
        ServiceDescriptor::new("bag3d", "ogc-features", "pand").with_base_url("https://api.3dbag.test"),
        bbox,
    )
}

#[rstest]
#[tokio::test]
async fn multi_page_cells_decode_with_their_own_transform(request: RetrievalRequest) {
    let transport = three_d_bag();
    let (sender, mut progress) = mpsc::unbounded_channel();
    let retriever = FeatureRetriever::new(ProfileRegistry::builtin(), RetrievalConfig::default())
        .with_progress(sender);

    let retrieval = retriever
        .retrieve_with_transport(transport.clone(), &request, CancellationToken::new())
        .await
        .expect("retrieval succeeds");

    let Retrieval::Complete(set) = retrieval else {
        panic!("every cell should succeed");
    };
    // Six cells, two own buildings each, plus the shared border building.
    assert_eq!(set.len(), 13);
    assert_eq!(set.duplicates_discarded, 5);
    assert!(set.inconsistent_ids.is_empty());

    let a = set.get("pand-80250-429250-a").expect("first page building");
    assert_eq!(first_vertex(a), Coord3 { x: 80_251.0, y: 429_252.0, z: 3.0 });
    let b = set.get("pand-80250-429250-b").expect("second page building");
    assert_eq!(first_vertex(b), Coord3 { x: 80_351.0, y: 429_352.0, z: 20.0 });
    assert_eq!(b.source_page.page_number, 1);
    let border = set.get(BORDER_ID).expect("border building");
    assert_eq!(first_vertex(border), Coord3 { x: 80_300.0, y: 429_300.0, z: 5.0 });
    assert_eq!(
        border.attributes.get("status"),
        Some(&AttributeValue::from("Pand in gebruik"))
    );

    let requests = transport.requests();
    assert_eq!(requests.len(), 12);
    assert!(requests.iter().all(|url| url.path() == "/collections/pand/items"));
    assert!(
        requests
            .iter()
            .all(|url| url.query_pairs().any(|(k, v)| k == "limit" && v == "100"))
    );
    assert!(requests.iter().all(|url| !url.query_pairs().any(|(k, _)| k == "bbox-crs")));

    let mut events = Vec::new();
    while let Ok(event) = progress.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 6);
    assert_eq!(events.last().map(|e| e.cumulative_features), Some(13));
}

#[rstest]
#[tokio::test]
async fn failing_second_pages_fail_their_cells(request: RetrievalRequest) {
    let transport = Arc::new(StubTransport::from_fn(|url| {
        let origin = cell_origin(url);
        match (origin, url.query_pairs().any(|(k, _)| k == "page")) {
            ((80_000, 429_000), true) => StubReply::status(500),
            (_, true) => StubReply::json(second_page(origin)),
            (_, false) => StubReply::json(first_page(url, origin)),
        }
    }));
    let config = RetrievalConfig::default()
        .with_retry(RetryPolicy::default().with_base_delay(Duration::ZERO))
        .with_cell_retry_delay(Duration::ZERO);
    let retriever = FeatureRetriever::new(ProfileRegistry::builtin(), config);

    let retrieval = retriever
        .retrieve_with_transport(transport, &request, CancellationToken::new())
        .await
        .expect("other cells succeed");

    let Retrieval::Partial(partial) = retrieval else {
        panic!("the first cell should fail");
    };
    let failed = partial.failed_cells();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].index, 0);
    assert_eq!(failed[0].attempts, 2);
    assert_eq!(failed[0].bbox.max_x(), 80_250.0);
    // The failed cell's first page is not merged.
    assert!(partial.features.get("pand-80000-429000-a").is_none());
    assert_eq!(partial.features.len(), 11);
}
