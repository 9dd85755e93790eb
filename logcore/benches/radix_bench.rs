//! Microbenchmarks for the literal+parser radix tree: pattern compilation
//! plus lookup against a moderately sized rule set, with and without a
//! matching literal prefix.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use logcore::radix::{compile_pattern, Node};

fn sample_patterns() -> Vec<String> {
    let mut patterns = Vec::new();
    for i in 0..200 {
        patterns.push(format!("service-{i}: request @STRING:method@ completed in @NUMBER:ms@ ms"));
    }
    patterns.push("sshd[@NUMBER@]: Failed password for @STRING:user@ from @IPv4:addr@ port @NUMBER:port@ ssh2".to_string());
    patterns.push("sshd[@NUMBER@]: Accepted password for @STRING:user@ from @IPv4:addr@ port @NUMBER:port@ ssh2".to_string());
    patterns
}

fn build_tree() -> Node<usize> {
    let mut tree = Node::new();
    for (i, pattern) in sample_patterns().iter().enumerate() {
        let tokens = compile_pattern(pattern).expect("sample patterns are well-formed");
        tree.insert(&tokens, i).expect("sample patterns do not collide");
    }
    tree
}

fn bench_compile_pattern(c: &mut Criterion) {
    let pattern = "sshd[@NUMBER@]: Failed password for @STRING:user@ from @IPv4:addr@ port @NUMBER:port@ ssh2";
    c.bench_function("compile_pattern", |b| {
        b.iter(|| compile_pattern(black_box(pattern)).unwrap())
    });
}

fn bench_insert(c: &mut Criterion) {
    let patterns = sample_patterns();
    let compiled: Vec<_> = patterns.iter().map(|p| compile_pattern(p).unwrap()).collect();
    c.bench_function("radix_insert_all", |b| {
        b.iter(|| {
            let mut tree = Node::new();
            for (i, tokens) in compiled.iter().enumerate() {
                tree.insert(black_box(tokens), i).unwrap();
            }
            black_box(&tree);
        })
    });
}

fn bench_lookup_hit(c: &mut Criterion) {
    let tree = build_tree();
    let input = b"sshd[1234]: Failed password for root from 10.0.0.1 port 52345 ssh2";
    c.bench_function("radix_lookup_hit", |b| {
        b.iter(|| black_box(tree.lookup(black_box(input))))
    });
}

fn bench_lookup_miss(c: &mut Criterion) {
    let tree = build_tree();
    let input = b"completely unrelated free-form text that matches nothing at all";
    c.bench_function("radix_lookup_miss", |b| {
        b.iter(|| black_box(tree.lookup(black_box(input))))
    });
}

criterion_group!(benches, bench_compile_pattern, bench_insert, bench_lookup_hit, bench_lookup_miss);
criterion_main!(benches);
