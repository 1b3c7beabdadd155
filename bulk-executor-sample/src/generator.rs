use std::convert::Infallible;

use bulk_executor::{Edge, GraphElement, Vertex};
use futures::{stream, Stream};

/// Identifier longer than any store accepts, so the first vertex always ends up as bad input.
pub fn long_id() -> String {
    "1".repeat(2000)
}

/// One bad vertex followed by `count` vertices with ids "0".."count-1".
pub fn generate_vertices(
    count: u64,
    partition_key: &str,
) -> impl Stream<Item = Result<GraphElement, Infallible>> {
    let partition_key = partition_key.to_string();

    let mut bad = Vertex::new(long_id(), "vertex");
    bad.add_property(partition_key.clone(), 0);

    let vertices = (0..count).map(move |i| {
        let i = i as i64;
        let mut v = Vertex::new(i.to_string(), "vertex");
        v.add_property(partition_key.clone(), i);
        v.add_property("name1", format!("name{i}"));
        v.add_property("name2", i * 2);
        v.add_property("name3", i * 3);
        v.add_property("name4", i + 100);
        GraphElement::from(v)
    });

    stream::iter(std::iter::once(GraphElement::from(bad)).chain(vertices).map(Ok))
}

/// A chain of `count - 1` "knows" edges, e{i} going from vertex i to vertex i+1.
pub fn generate_edges(count: u64) -> impl Stream<Item = Result<GraphElement, Infallible>> {
    stream::iter((0..count.saturating_sub(1)).map(|i| {
        let i = i as i64;
        let mut e = Edge::new(
            format!("e{i}"),
            "knows",
            i.to_string(),
            (i + 1).to_string(),
            "vertex",
            "vertex",
            i,
            i + 1,
        );
        e.add_property("duration", i);
        Ok(GraphElement::from(e))
    }))
}
