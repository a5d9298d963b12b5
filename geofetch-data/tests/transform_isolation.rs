//! Property-based tests for per-page vertex transforms under concurrency.
//!
//! # Invariants tested
//!
//! - **Transform isolation:** every compressed feature decodes with the
//!   transform of the page it arrived on, however cell pages interleave.
//! - **Completeness:** no feature is lost or duplicated when pages of
//!   different cells complete out of order.

use std::sync::Arc;
use std::time::Duration;

use geofetch_core::test_support::rd_bbox;
use geofetch_core::{Coord3, GeometryValue, PlannerConfig, ProfileRegistry, Retrieval};
use geofetch_data::test_support::{StubReply, StubTransport};
use geofetch_data::{FeatureRetriever, RetrievalConfig, RetrievalRequest, ServiceDescriptor};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;
use url::Url;

const ORIGIN: (i64, i64) = (80_000, 429_000);
const CELL: i64 = 250;

/// Timing and transform of one cell.
#[derive(Debug, Clone, Copy)]
struct CellScript {
    delays_ms: [u64; 2],
    scale_exp: u32,
    offset: i64,
}

fn cell_script() -> impl Strategy<Value = CellScript> {
    (0_u64..12, 0_u64..12, 0_u32..4, -400_i64..400).prop_map(|(d1, d2, scale_exp, offset)| {
        CellScript {
            delays_ms: [d1, d2],
            scale_exp,
            offset,
        }
    })
}

fn cell_of(url: &Url) -> (usize, (i64, i64)) {
    let (_, bbox) = url
        .query_pairs()
        .find(|(k, _)| k == "bbox")
        .expect("bbox parameter");
    let mut bounds = bbox.split(',').map(|v| v.parse::<f64>().expect("numeric bound"));
    let x = bounds.next().expect("min x") as i64;
    let y = bounds.next().expect("min y") as i64;
    let column = usize::try_from((x - ORIGIN.0) / CELL).expect("inside grid");
    let row = usize::try_from((y - ORIGIN.1) / CELL).expect("inside grid");
    (row * 2 + column, (x, y))
}

/// Real-world position the feature on `page` of the cell at `origin` must
/// decode to.
fn target((x, y): (i64, i64), page: i64) -> [i64; 3] {
    [x + 10 * page + 1, y + 20 * page + 2, page]
}

fn page_body(url: &Url, script: CellScript, origin: (i64, i64), page: i64) -> String {
    let factor = 1_i64 << (script.scale_exp + u32::try_from(page).expect("small page"));
    let scale = 1.0 / factor as f64;
    let sign = if page == 0 { 1 } else { -1 };
    let translate = [origin.0 + sign * script.offset, origin.1 - sign * script.offset, sign * 7];
    let vertex: Vec<i64> = target(origin, page)
        .iter()
        .zip(translate)
        .map(|(t, tr)| (t - tr) * factor)
        .collect();
    let id = format!("pand-{}-{}-{page}", origin.0, origin.1);
    let link = if page == 0 {
        format!(r#", "links": [{{"rel": "next", "href": "{url}&page=1"}}]"#)
    } else {
        String::new()
    };
    format!(
        r#"{{"metadata": {{"transform": {{"scale": [{scale:?}, {scale:?}, {scale:?}],
                "translate": [{}, {}, {}]}}}},
            "features": [{{"type": "CityJSONFeature", "id": "{id}",
                "CityObjects": {{"{id}": {{"type": "Building", "geometry": [
                    {{"type": "MultiSurface", "lod": "0", "boundaries": [[[0, 0, 0]]]}}]}}}},
                "vertices": [[{}, {}, {}]]}}]{link}}}"#,
        translate[0], translate[1], translate[2], vertex[0], vertex[1], vertex[2]
    )
}

fn retrieve(scripts: Vec<CellScript>) -> Retrieval {
    let transport = Arc::new(StubTransport::from_fn(move |url| {
        let (index, origin) = cell_of(url);
        let script = scripts[index];
        let page = i64::from(url.query_pairs().any(|(k, _)| k == "page"));
        let delay = Duration::from_millis(script.delays_ms[usize::from(page == 1)]);
        StubReply::json(page_body(url, script, origin, page)).delayed(delay)
    }));
    let config = RetrievalConfig::default()
        .with_planner(PlannerConfig::default().with_area_threshold(0.0))
        .with_concurrency(4);
    let retriever = FeatureRetriever::new(ProfileRegistry::builtin(), config);
    let bbox = rd_bbox(80_000.0, 429_000.0, 80_500.0, 429_500.0).expect("valid bbox");
    let request = RetrievalRequest::new(
        ServiceDescriptor::new("bag3d", "ogc-features", "pand").with_base_url("https://api.3dbag.test"),
        bbox,
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime
        .block_on(retriever.retrieve_with_transport(transport, &request, CancellationToken::new()))
        .expect("retrieval succeeds")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: each feature lands exactly where its own page's transform puts it.
    #[test]
    fn features_decode_with_their_page_transform(
        scripts in prop::collection::vec(cell_script(), 4),
    ) {
        let retrieval = retrieve(scripts);
        prop_assert!(retrieval.is_complete());
        let set = retrieval.feature_set();
        prop_assert_eq!(set.len(), 8);
        prop_assert_eq!(set.duplicates_discarded, 0);

        for row in 0..2 {
            for column in 0..2 {
                let origin = (ORIGIN.0 + column * CELL, ORIGIN.1 + row * CELL);
                for page in 0..2 {
                    let id = format!("pand-{}-{}-{page}", origin.0, origin.1);
                    let feature = set.get(&id).expect("feature retrieved");
                    let GeometryValue::Polygon(surface) = &feature.geometry else {
                        panic!("{id} should decode to a polygon");
                    };
                    let [x, y, z] = target(origin, page);
                    prop_assert_eq!(
                        surface[0][0],
                        Coord3 { x: x as f64, y: y as f64, z: z as f64 }
                    );
                    prop_assert_eq!(feature.source_page.page_number, usize::try_from(page).expect("small page"));
                }
            }
        }
    }
}
