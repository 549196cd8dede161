use scraper::{Html, Node};

/// 去掉 AIM 消息中的 html 标记
/// 保留空白，解码实体，<br> 转为换行
pub(crate) fn strip_html(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut text = String::with_capacity(html.len());
    for node in fragment.tree.root().descendants() {
        match node.value() {
            Node::Text(t) => text.push_str(t),
            Node::Element(e) if e.name() == "br" => text.push('\n'),
            _ => {}
        }
    }
    text
}
