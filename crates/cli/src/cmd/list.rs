use std::path::Path;

use anyhow::Result;
use clap::Args;
use owo_colors::{OwoColorize, Stream};

use keg_lib::formula::DependencyKind;

use super::load_catalog;
use crate::output::{print_info, print_json, symbols};

#[derive(Args, Debug)]
pub struct ListArgs {
  /// Output as JSON
  #[arg(long)]
  json: bool,
}

pub fn cmd_list(args: ListArgs, catalog_path: &Path, verbose: bool) -> Result<()> {
  let catalog = load_catalog(catalog_path)?;

  if args.json {
    return print_json(&catalog.formulas());
  }

  if catalog.is_empty() {
    print_info(&format!("No formulas in {}", catalog_path.display()));
    return Ok(());
  }

  for formula in catalog.formulas() {
    let desc = formula.desc.as_deref().unwrap_or("");
    println!(
      "{} {} {}",
      symbols::INFO,
      formula.label(),
      desc.if_supports_color(Stream::Stdout, |s| s.dimmed())
    );

    if verbose {
      if let Some(homepage) = &formula.homepage {
        println!("    homepage: {}", homepage);
      }
      for kind in [DependencyKind::Build, DependencyKind::Runtime, DependencyKind::Optional] {
        let names: Vec<&str> = formula.dependencies_of(kind).map(|d| d.name.as_str()).collect();
        if !names.is_empty() {
          println!("    {} dependencies: {}", kind, names.join(", "));
        }
      }
      for (name, option) in &formula.options {
        let default = if option.default { "on" } else { "off" };
        match &option.desc {
          Some(desc) => println!("    option {} ({}): {}", name, default, desc),
          None => println!("    option {} ({})", name, default),
        }
      }
    }
  }
  Ok(())
}
