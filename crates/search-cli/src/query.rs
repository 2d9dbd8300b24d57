use anyhow::Context;
use pdbsim_engine::{SearchEngine, StructureStore};

/// Search query resolved from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuery {
    pub chain_id: String,
    pub display_name: String,
}

fn entry_of(chain_id: &str) -> &str {
    chain_id.split(':').next().unwrap_or(chain_id)
}

/// `1ABC:A` is taken as is; `1ABC` resolves to `chain` or the first usable chain.
pub async fn resolve_query(
    engine: &SearchEngine,
    store: &dyn StructureStore,
    query: &str,
    chain: Option<&str>,
) -> anyhow::Result<ResolvedQuery> {
    let query = query.trim();
    let chain_id = if query.contains(':') {
        query.to_string()
    } else {
        let chains = engine.query_chains(query).await?;
        match chain {
            Some(wanted) => {
                let wanted = format!("{query}:{wanted}");
                chains
                    .into_iter()
                    .find(|c| c.chain_id == wanted)
                    .map(|c| c.chain_id)
                    .with_context(|| format!("chain {wanted} is not indexed or too short"))?
            }
            None => chains
                .into_iter()
                .next()
                .map(|c| c.chain_id)
                .with_context(|| format!("no usable chain in {query}"))?,
        }
    };

    let entry = entry_of(&chain_id);
    let display_name = store
        .entry_name(entry)
        .await?
        .unwrap_or_else(|| entry.to_string());
    Ok(ResolvedQuery {
        chain_id,
        display_name,
    })
}
