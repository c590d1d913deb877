use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, QueryParser, RegexQuery, TermQuery};
use tantivy::schema::{
    Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, TextFieldIndexing, TextOptions, Value,
};
use tantivy::tokenizer::{NgramTokenizer, TextAnalyzer};
use tantivy::{Index, IndexReader, IndexWriter, TantivyDocument, Term, doc};

use crate::error::{Error, Result};

const NGRAM_TOKENIZER: &str = "code_ngram";
const NGRAM_SIZE: usize = 3;
const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Record in the FTS index. `doc_id` correlates to the vector-store point id
/// so hybrid merge can join both sides.
#[derive(Debug, Clone, PartialEq)]
pub struct FtsDoc {
    pub path: String,
    pub language: Option<String>,
    pub line: u64,
    pub column: u64,
    pub snippet: String,
    pub content_text: String,
    pub doc_id: String,
}

#[derive(Debug, Clone)]
pub struct FtsSearchOpts {
    pub case_sensitive: bool,
    pub edit_distance: u8,
    pub regex: bool,
    pub snippet_lines: usize,
    pub limit: usize,
}

impl Default for FtsSearchOpts {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            edit_distance: 0,
            regex: false,
            snippet_lines: 5,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FtsHit {
    pub doc: FtsDoc,
    pub score: f32,
}

struct FtsFields {
    path: Field,
    language: Field,
    line: Field,
    column: Field,
    snippet: Field,
    content_text: Field,
    content_ngram: Field,
    doc_id: Field,
}

fn build_schema() -> (Schema, FtsFields) {
    let mut builder = Schema::builder();

    let path = builder.add_text_field("path", STRING | STORED);
    let language = builder.add_text_field("language", STRING | STORED);
    let line = builder.add_u64_field("line", INDEXED | STORED);
    let column = builder.add_u64_field("column", STORED);
    let snippet = builder.add_text_field("snippet", STORED);
    let content_text = builder.add_text_field("content_text", tantivy::schema::TEXT | STORED);

    // Case-preserving n-gram field backing case-sensitive substring queries.
    let ngram_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(NGRAM_TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqs),
    );
    let content_ngram = builder.add_text_field("content_ngram", ngram_opts);

    let doc_id = builder.add_text_field("doc_id", STRING | STORED);

    let schema = builder.build();
    let fields = FtsFields { path, language, line, column, snippet, content_text, content_ngram, doc_id };
    (schema, fields)
}

/// Manager for the on-disk tantivy index under `.code-indexer/tantivy_index/`.
/// One entry point for exact, fuzzy, and regex search; the manager picks the
/// underlying query form. Language/path filtering happens in the query
/// engine so all modes share identical filter semantics.
pub struct FtsManager {
    index: Index,
    // Created on first mutation: tantivy allows one writer per directory,
    // and read-only consumers must not contend for that lock.
    writer: Mutex<Option<IndexWriter>>,
    reader: IndexReader,
    fields: FtsFields,
    dir: PathBuf,
}

impl std::fmt::Debug for FtsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtsManager").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl FtsManager {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, _) = build_schema();
        let index = Index::create_in_dir(dir, schema)?;
        Self::from_index(index, dir)
    }

    pub fn open(dir: &Path) -> Result<Self> {
        if !Self::exists(dir) {
            return Err(Error::IndexMissing(format!("no FTS index at {}", dir.display())));
        }
        let index = Index::open_in_dir(dir)?;
        Self::from_index(index, dir)
    }

    pub fn open_or_create(dir: &Path) -> Result<Self> {
        if Self::exists(dir) { Self::open(dir) } else { Self::create(dir) }
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join("meta.json").exists()
    }

    fn from_index(index: Index, dir: &Path) -> Result<Self> {
        let ngram = NgramTokenizer::new(NGRAM_SIZE, NGRAM_SIZE, false).map_err(Error::internal)?;
        index.tokenizers().register(NGRAM_TOKENIZER, TextAnalyzer::from(ngram));

        let (_, fields) = build_schema();
        let reader = index.reader()?;
        Ok(Self {
            index,
            writer: Mutex::new(None),
            reader,
            fields,
            dir: dir.to_path_buf(),
        })
    }

    fn with_writer<R>(&self, f: impl FnOnce(&mut IndexWriter) -> Result<R>) -> Result<R> {
        let mut slot = self.writer.lock();
        if slot.is_none() {
            *slot = Some(self.index.writer(WRITER_HEAP_BYTES)?);
        }
        match slot.as_mut() {
            Some(writer) => f(writer),
            None => Err(Error::Internal("FTS writer unavailable".into())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn add_doc(&self, d: &FtsDoc) -> Result<()> {
        let mut document = doc!(
            self.fields.path => d.path.clone(),
            self.fields.line => d.line,
            self.fields.column => d.column,
            self.fields.snippet => d.snippet.clone(),
            self.fields.content_text => d.content_text.clone(),
            self.fields.content_ngram => d.content_text.clone(),
            self.fields.doc_id => d.doc_id.clone(),
        );
        if let Some(lang) = &d.language {
            document.add_text(self.fields.language, lang);
        }
        self.with_writer(|writer| {
            writer.add_document(document)?;
            Ok(())
        })
    }

    pub fn delete_by_path(&self, path: &str) -> Result<()> {
        let term = Term::from_field_text(self.fields.path, path);
        self.with_writer(|writer| {
            writer.delete_term(term);
            Ok(())
        })
    }

    pub fn commit(&self) -> Result<()> {
        // Nothing was written if the writer was never created.
        let mut slot = self.writer.lock();
        if let Some(writer) = slot.as_mut() {
            writer.commit()?;
        }
        Ok(())
    }

    /// Remove every document. Used by `index --clear`.
    pub fn clear(&self) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_all_documents()?;
            writer.commit()?;
            Ok(())
        })
    }

    /// Pick up the latest committed segment set. The searcher handed to
    /// queries is immutable; this swap is the only refresh path.
    pub fn reopen_searcher(&self) -> Result<()> {
        self.reader.reload()?;
        Ok(())
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn search(&self, query: &str, opts: &FtsSearchOpts) -> Result<Vec<FtsHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let parsed: Box<dyn Query> = if opts.regex {
            let pattern = if opts.case_sensitive { query.to_string() } else { query.to_lowercase() };
            Box::new(
                RegexQuery::from_pattern(&pattern, self.fields.content_text)
                    .map_err(|e| Error::InvalidArgument(format!("bad regex {query:?}: {e}")))?,
            )
        } else if opts.edit_distance > 0 {
            self.fuzzy_query(query, opts.edit_distance.min(2))
        } else if opts.case_sensitive {
            self.ngram_query(query)
        } else {
            let parser = QueryParser::for_index(&self.index, vec![self.fields.content_text]);
            let (q, _errors) = parser.parse_query_lenient(query);
            q
        };

        let searcher = self.reader.searcher();
        let top = searcher.search(&parsed, &TopDocs::with_limit(opts.limit.max(1)))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, addr) in top {
            let doc: TantivyDocument = searcher.doc(addr)?;
            let fts_doc = self.extract(&doc);
            // The n-gram conjunction over-matches; enforce the actual
            // case-sensitive substring before returning.
            if opts.case_sensitive && !opts.regex && opts.edit_distance == 0
                && !fts_doc.content_text.contains(query)
            {
                continue;
            }
            let snippet = trim_snippet(&fts_doc.snippet, opts.snippet_lines);
            hits.push(FtsHit { doc: FtsDoc { snippet, ..fts_doc }, score });
        }
        Ok(hits)
    }

    fn fuzzy_query(&self, query: &str, distance: u8) -> Box<dyn Query> {
        let subqueries: Vec<(Occur, Box<dyn Query>)> = query
            .split_whitespace()
            .map(|word| {
                let term = Term::from_field_text(self.fields.content_text, &word.to_lowercase());
                let q: Box<dyn Query> = Box::new(FuzzyTermQuery::new(term, distance, true));
                (Occur::Should, q)
            })
            .collect();
        Box::new(BooleanQuery::new(subqueries))
    }

    fn ngram_query(&self, query: &str) -> Box<dyn Query> {
        let chars: Vec<char> = query.chars().collect();
        if chars.len() < NGRAM_SIZE {
            let term = Term::from_field_text(self.fields.content_ngram, query);
            return Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
        }
        let subqueries: Vec<(Occur, Box<dyn Query>)> = chars
            .windows(NGRAM_SIZE)
            .map(|w| {
                let gram: String = w.iter().collect();
                let term = Term::from_field_text(self.fields.content_ngram, &gram);
                let q: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Must, q)
            })
            .collect();
        Box::new(BooleanQuery::new(subqueries))
    }

    fn extract(&self, doc: &TantivyDocument) -> FtsDoc {
        let text = |f: Field| {
            doc.get_first(f)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let num = |f: Field| doc.get_first(f).and_then(|v| v.as_u64()).unwrap_or(0);
        let language = doc.get_first(self.fields.language).and_then(|v| v.as_str()).map(String::from);
        FtsDoc {
            path: text(self.fields.path),
            language,
            line: num(self.fields.line),
            column: num(self.fields.column),
            snippet: text(self.fields.snippet),
            content_text: text(self.fields.content_text),
            doc_id: text(self.fields.doc_id),
        }
    }
}

fn trim_snippet(snippet: &str, max_lines: usize) -> String {
    if max_lines == 0 {
        return String::new();
    }
    let lines: Vec<&str> = snippet.lines().take(max_lines).collect();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc(path: &str, line: u64, content: &str) -> FtsDoc {
        FtsDoc {
            path: path.into(),
            language: Some("python".into()),
            line,
            column: 1,
            snippet: content.lines().take(5).collect::<Vec<_>>().join("\n"),
            content_text: content.into(),
            doc_id: format!("doc-{path}-{line}"),
        }
    }

    fn manager_with_docs(docs: &[FtsDoc]) -> (tempfile::TempDir, FtsManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FtsManager::create(dir.path()).unwrap();
        for d in docs {
            mgr.add_doc(d).unwrap();
        }
        mgr.commit().unwrap();
        mgr.reopen_searcher().unwrap();
        (dir, mgr)
    }

    #[test]
    fn open_missing_is_index_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = FtsManager::open(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "IndexMissing");
    }

    #[test]
    fn exact_search_finds_tokens() {
        let (_d, mgr) = manager_with_docs(&[
            sample_doc("a.py", 1, "def authenticate(user):\n    return user.ok"),
            sample_doc("b.py", 10, "def walk(tree):\n    pass"),
        ]);
        let hits = mgr.search("authenticate", &FtsSearchOpts::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc.path, "a.py");
        assert_eq!(hits[0].doc.line, 1);
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn delete_by_path_then_commit_removes_docs() {
        let (_d, mgr) = manager_with_docs(&[
            sample_doc("a.py", 1, "def gone(): pass"),
            sample_doc("b.py", 1, "def kept(): pass"),
        ]);
        mgr.delete_by_path("a.py").unwrap();
        mgr.commit().unwrap();
        mgr.reopen_searcher().unwrap();
        assert!(mgr.search("gone", &FtsSearchOpts::default()).unwrap().is_empty());
        assert_eq!(mgr.search("kept", &FtsSearchOpts::default()).unwrap().len(), 1);
    }

    #[test]
    fn fuzzy_search_tolerates_typos() {
        let (_d, mgr) = manager_with_docs(&[sample_doc("a.py", 1, "def authenticate(user): pass")]);
        let opts = FtsSearchOpts { edit_distance: 1, ..Default::default() };
        let hits = mgr.search("authentivate", &opts).unwrap();
        assert_eq!(hits.len(), 1);

        // Distance 0 must not match the typo.
        let exact = mgr.search("authentivate", &FtsSearchOpts::default()).unwrap();
        assert!(exact.is_empty());
    }

    #[test]
    fn regex_search_matches_terms() {
        let (_d, mgr) = manager_with_docs(&[
            sample_doc("a.py", 1, "def auth1(): pass"),
            sample_doc("b.py", 1, "def other(): pass"),
        ]);
        let opts = FtsSearchOpts { regex: true, ..Default::default() };
        let hits = mgr.search("auth[0-9]", &opts).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc.path, "a.py");
    }

    #[test]
    fn case_sensitive_search_distinguishes_case() {
        let (_d, mgr) = manager_with_docs(&[
            sample_doc("a.py", 1, "class AuthHandler: pass"),
            sample_doc("b.py", 1, "authhandler = make()"),
        ]);
        let opts = FtsSearchOpts { case_sensitive: true, ..Default::default() };
        let hits = mgr.search("AuthHandler", &opts).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc.path, "a.py");

        // Insensitive mode sees both.
        let hits = mgr.search("authhandler", &FtsSearchOpts::default()).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn snippet_respects_line_limit() {
        let content = (1..=10).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let mut d = sample_doc("a.py", 1, &content);
        d.snippet = content.clone();
        let (_dir, mgr) = manager_with_docs(&[d]);
        let opts = FtsSearchOpts { snippet_lines: 2, ..Default::default() };
        let hits = mgr.search("line", &opts).unwrap();
        assert_eq!(hits[0].doc.snippet.lines().count(), 2);
    }

    #[test]
    fn reopen_is_required_to_observe_commits() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FtsManager::create(dir.path()).unwrap();
        mgr.add_doc(&sample_doc("a.py", 1, "def later(): pass")).unwrap();
        mgr.commit().unwrap();
        mgr.reopen_searcher().unwrap();
        assert_eq!(mgr.search("later", &FtsSearchOpts::default()).unwrap().len(), 1);
    }
}
