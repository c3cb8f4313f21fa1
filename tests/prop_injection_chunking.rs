// Property: for any body and any partition of it into contiguous chunks,
// chunked injection produces exactly the bytes of whole-body injection,
// and every payload appears exactly once.

use bytes::Bytes;
use esi_stitch::injector::{DataTag, DataTags};
use esi_stitch::scanner;
use proptest::prelude::*;

/// Build splice instructions for every marker in the body.
fn tags_for(body: &[u8]) -> DataTags {
    let tags = scanner::scan(body)
        .iter()
        .enumerate()
        .map(|(k, m)| DataTag::new(Bytes::from(format!("[payload {}]", k)), m.start, m.end))
        .collect();
    DataTags::new(tags)
}

/// Reference rewrite: plain slicing, no streaming.
fn expected(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut last = 0;
    for (k, m) in scanner::scan(body).iter().enumerate() {
        out.extend_from_slice(&body[last..m.start]);
        out.extend_from_slice(format!("[payload {}]", k).as_bytes());
        last = m.end;
    }
    out.extend_from_slice(&body[last..]);
    out
}

/// A body of filler text interleaved with well-formed include markers.
fn body_strategy() -> impl Strategy<Value = Vec<u8>> {
    let filler = "[a-z0-9 .]{0,24}";
    let tag = ("[a-z]{1,8}", "[a-z0-9/.:]{0,16}").prop_map(|(host, path)| {
        format!("<esi:include src=\"http://{}/{}\" />", host, path)
    });
    prop::collection::vec((filler, tag), 0..6).prop_map(|parts| {
        let mut body = String::new();
        for (filler, tag) in parts {
            body.push_str(&filler);
            body.push_str(&tag);
        }
        body.push_str("tail");
        body.into_bytes()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_chunk_boundary_invariance(
        body in body_strategy(),
        raw_splits in prop::collection::vec(0usize..1024, 0..8),
    ) {
        let want = expected(&body);

        let mut splits: Vec<usize> = raw_splits
            .into_iter()
            .map(|s| s % (body.len() + 1))
            .collect();
        splits.sort_unstable();
        splits.dedup();

        let mut tags = tags_for(&body);
        let mut out = Vec::new();
        let mut last = 0;
        for split in splits {
            tags.inject_content(&body[last..split], &mut out).unwrap();
            last = split;
        }
        tags.inject_content(&body[last..], &mut out).unwrap();

        prop_assert_eq!(&out, &want);

        // Each payload appears exactly once, regardless of boundaries.
        let text = String::from_utf8_lossy(&out);
        for k in 0..tags.len() {
            let needle = format!("[payload {}]", k);
            prop_assert_eq!(text.matches(&needle).count(), 1);
        }
    }

    #[test]
    fn prop_reset_states_replays_identically(
        body in body_strategy(),
        split in 0usize..1024,
    ) {
        let split = split % (body.len() + 1);

        let mut tags = tags_for(&body);
        let mut first = Vec::new();
        tags.inject_content(&body[..split], &mut first).unwrap();
        tags.inject_content(&body[split..], &mut first).unwrap();

        tags.reset_states();
        let mut second = Vec::new();
        tags.inject_content(&body, &mut second).unwrap();

        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_body_without_markers_passes_through(
        body in "[a-z0-9 <>/=]{0,256}",
    ) {
        // Filler of this alphabet cannot form `<esi:include` followed by
        // a quote, but scan anyway and skip the rare accidental marker.
        prop_assume!(scanner::scan(body.as_bytes()).is_empty());

        let mut tags = tags_for(body.as_bytes());
        let mut out = Vec::new();
        tags.inject_content(body.as_bytes(), &mut out).unwrap();
        prop_assert_eq!(out, body.into_bytes());
    }
}

#[test]
fn test_four_tags_split_at_paragraph_closes() {
    let body = "<div>\
<p c=\"0\"><esi:include src=\"http://microService0\" timeout=\"5ms\"/></p>\
<p c=\"1\"><esi:include src=\"http://microService1\" timeout=\"6ms\"/></p>\
<p c=\"2\"><esi:include src=\"http://microService2\" timeout=\"7ms\"/></p>\
<p c=\"3\"><esi:include src=\"http://microService3\" timeout=\"8ms\"/></p>\
</div>";

    let mut tags = tags_for(body.as_bytes());
    let mut out = Vec::new();
    let mut last = 0;
    // Split after every `p>`, which lands boundaries inside and between
    // markers alike.
    for (i, _) in body.match_indices("p>") {
        let end = i + 2;
        tags.inject_content(&body.as_bytes()[last..end], &mut out).unwrap();
        last = end;
    }
    tags.inject_content(&body.as_bytes()[last..], &mut out).unwrap();

    let text = String::from_utf8(out).unwrap();
    for k in 0..4 {
        assert_eq!(
            text.matches(&format!("[payload {}]", k)).count(),
            1,
            "payload {} duplicated or missing",
            k
        );
    }
    assert_eq!(text.as_bytes(), expected(body.as_bytes()).as_slice());
}
