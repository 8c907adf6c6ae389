use pulse_adapters::{read_csv_batch, ColumnMapping, Normalizer};

const EXPORT: &str = "email;nome;email_corporativo;celular;area;cargo;funcao;localidade;tempo_de_empresa;genero;geracao;Data da Resposta;Interesse no Cargo;Contribuição;Aprendizado e Desenvolvimento;Feedback;Interação com Gestor;Clareza sobre Possibilidades de Carreira;Expectativa de Permanência;eNPS;Comentários - Feedback;[Aberta] eNPS
john.doe@pin.com;John Doe;john.doe@pin.com;;Engineering;Dev;Dev;Remote;Entre 1 e 2;;;01/01/2022;5;5;5;5;5;5;5;10;;Great place!
jane@pin.com;Jane;-;;Sales;-;;Office;Mais de 5 anos;;;13/13/2022;4;4;4;4;4;4;4;7;;
mark@pin.com;Mark;;;Sales;;;Office;;;;02/01/2022;3;;;;;;;6;ok;
";

#[test]
fn client_export_normalizes_with_row_level_rejections() {
    let batch = read_csv_batch(EXPORT.as_bytes(), b';').expect("csv");
    assert_eq!(batch.rows.len(), 3);

    let normalized = Normalizer::new(ColumnMapping::default()).normalize_batch(&batch.rows);
    assert_eq!(normalized.records.len(), 2);
    assert_eq!(normalized.rejections.len(), 1);

    let rejection = &normalized.rejections[0];
    assert_eq!(rejection.row, 2);
    assert_eq!(rejection.field, "response_date");
    assert_eq!(rejection.key.as_deref(), Some("jane@pin.com"));

    let john = &normalized.records[0];
    assert_eq!(john.key.to_string(), "john.doe@pin.com/2022-01");
    assert_eq!(john.score, 10);
    assert_eq!(john.dimensions.len(), 7);
    assert_eq!(john.tenure_rank, 2);
    assert_eq!(john.comment.as_deref(), Some("Great place!"));
    assert_eq!(john.function.as_deref(), Some("Dev"));
    assert!(john.dimension_comments.is_empty());

    let mark = &normalized.records[1];
    assert_eq!(mark.comment, None);
    assert_eq!(mark.dimensions.len(), 1);
    assert_eq!(mark.department.as_deref(), Some("Sales"));
    assert_eq!(mark.dimension_comments.get("feedback").map(String::as_str), Some("ok"));
}
