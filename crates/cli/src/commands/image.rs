//! Image Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use metal_common::{Image, ImageQuery};
use metal_provider::{read_image, MetalClient, ProviderConfig};

use crate::output::{print_item, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ImageCommands {
    /// Look up an operating system image
    Get {
        /// Image slug
        slug: String,

        /// Image name
        #[arg(long)]
        name: Option<String>,

        /// Distribution
        #[arg(long)]
        distro: Option<String>,

        /// Distribution version
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(Serialize)]
pub struct ImageDisplay {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl From<Image> for ImageDisplay {
    fn from(image: Image) -> Self {
        Self {
            id: image.id,
            name: image.name,
            description: image.description.unwrap_or_default(),
        }
    }
}

impl TableDisplay for ImageDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Description"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.id.clone(), self.name.clone(), self.description.clone()]
    }
}

pub async fn execute(cmd: ImageCommands, config: &ProviderConfig, format: OutputFormat) -> Result<()> {
    let client = MetalClient::new(config)?;

    match cmd {
        ImageCommands::Get { slug, name, distro, version } => {
            let query = ImageQuery {
                slug: Some(slug),
                name,
                distro,
                version,
            };
            let image = read_image(&client, &query).await?;
            print_item(&ImageDisplay::from(image), format)?;
        }
    }

    Ok(())
}
