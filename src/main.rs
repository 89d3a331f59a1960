//! Headless demo renderer: evaluates the ocean node over an N×N grid of
//! shading points, fanned out across a bounded worker pool the way a
//! renderer would drive it, and writes the displacement heights as a PNG.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::unbounded;

use ocean_displacement_node::engine::scripted::ScriptedEngine;
use ocean_displacement_node::{OceanNode, OceanParams, Rgba, ShadingPoint, Vec3};

#[derive(Debug, Clone)]
struct Cli {
    params: Option<PathBuf>,
    size: u32,
    threads: usize,
    extent: f32,
    output: PathBuf,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            params: None,
            size: 512,
            threads: 8,
            extent: 20.0,
            output: PathBuf::from("ocean_heightmap.png"),
        }
    }
}

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--params" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --params"));
                };
                cli.params = Some(PathBuf::from(v));
                i += 2;
            }
            "--size" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --size"));
                };
                cli.size = v.parse().context("--size expects an integer")?;
                i += 2;
            }
            "--threads" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --threads"));
                };
                cli.threads = v.parse().context("--threads expects an integer")?;
                i += 2;
            }
            "--extent" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --extent"));
                };
                cli.extent = v.parse().context("--extent expects a float")?;
                i += 2;
            }
            "--out" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --out"));
                };
                cli.output = PathBuf::from(v);
                i += 2;
            }
            other => {
                return Err(anyhow!(
                    "unknown argument: {other} (supported: --params <params.json>, --size <n>, \
                     --threads <n>, --extent <f>, --out <heightmap.png>)"
                ));
            }
        }
    }
    Ok(cli)
}

fn load_params(cli: &Cli) -> Result<OceanParams> {
    let Some(path) = cli.params.as_ref() else {
        return Ok(OceanParams::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read params file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse params file {}", path.display()))
}

/// Evaluate every grid row across `threads` workers, one renderer-style
/// thread index per worker, and collect the rows of shading outputs.
fn render_field(
    node: &OceanNode<ScriptedEngine>,
    size: u32,
    extent: f32,
    threads: usize,
) -> Vec<Vec<Rgba>> {
    let (row_tx, row_rx) = unbounded::<u32>();
    let (result_tx, result_rx) = unbounded::<(u32, Vec<Rgba>)>();
    for y in 0..size {
        let _ = row_tx.send(y);
    }
    drop(row_tx);

    std::thread::scope(|scope| {
        for worker in 0..threads {
            let row_rx = row_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for y in row_rx.iter() {
                    let mut row = Vec::with_capacity(size as usize);
                    for x in 0..size {
                        let fx = (x as f32 / size as f32 - 0.5) * 2.0 * extent;
                        let fz = (y as f32 / size as f32 - 0.5) * 2.0 * extent;
                        let sp = ShadingPoint::at(Vec3::new(fx, 0.0, fz), worker);
                        row.push(node.evaluate(&sp));
                    }
                    let _ = result_tx.send((y, row));
                }
            });
        }
        drop(result_tx);
    });

    let mut rows = vec![Vec::new(); size as usize];
    for (y, row) in result_rx.iter() {
        rows[y as usize] = row;
    }
    rows
}

fn write_heightmap(rows: &[Vec<Rgba>], size: u32, output: &PathBuf) -> Result<()> {
    // Height in G, horizontal chop in R/B, all remapped from [-2, 2].
    let remap = |v: f32| ((v / 4.0 + 0.5).clamp(0.0, 1.0) * 255.0) as u8;
    let mut img = image::RgbImage::new(size, size);
    for (y, row) in rows.iter().enumerate() {
        for (x, px) in row.iter().enumerate() {
            img.put_pixel(
                x as u32,
                y as u32,
                image::Rgb([remap(px.r), remap(px.g), remap(px.b)]),
            );
        }
    }
    img.save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&args)?;
    let params = load_params(&cli)?;

    let threads = cli
        .threads
        .clamp(1, ocean_displacement_node::MAX_RENDER_THREADS);
    let engine = ScriptedEngine::new();
    let stats = engine.stats();
    let node = OceanNode::new(engine, params);

    let rows = render_field(&node, cli.size, cli.extent, threads);
    write_heightmap(&rows, cli.size, &cli.output)?;

    println!(
        "wrote {} ({}x{}, {} workers, {} contexts built, {} kernel runs)",
        cli.output.display(),
        cli.size,
        cli.size,
        threads,
        stats.contexts_built(),
        stats.runs()
    );
    Ok(())
}
